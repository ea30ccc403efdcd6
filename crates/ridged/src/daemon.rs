//! The event loop: one UDP socket, one timer, one core.
//!
//! The core is run-to-completion on this single task. Each turn updates
//! the context clock, feeds the core one event (a datagram or a timer
//! expiry), then carries out whatever [`Output`] actions the core
//! produced.
//!
//! The TUN side is a seam: decrypted payloads go to a [`PayloadSink`],
//! and the device reader would call [`PeerTable::send_payload`] with
//! buffers sized via `PeerTable::encrypt_head_space`. Device I/O itself
//! lives outside this crate.

use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use tokio::net::UdpSocket;

use ridge_core::peer::{Output, PeerAddress};
use ridge_core::{Buffer, Context, PeerTable, Timestamp};

/// Where decrypted payloads end up.
pub trait PayloadSink {
    fn deliver(&mut self, payload: Buffer);
}

/// Placeholder sink used until a TUN device is attached.
struct LogSink;

impl PayloadSink for LogSink {
    fn deliver(&mut self, payload: Buffer) {
        tracing::debug!(len = payload.len(), "payload delivered (no TUN device attached)");
    }
}

/// Poll ceiling when no timer is pending.
const IDLE_TICK: Duration = Duration::from_secs(60);

pub async fn run(
    mut ctx: Context,
    mut table: PeerTable,
    socket: UdpSocket,
    epoch: Instant,
) -> Result<()> {
    let mut sink = LogSink;
    let mut recv_buf = vec![0u8; 65536];
    let mut out: Vec<Output> = Vec::new();

    ctx.now = clock(epoch);
    table.schedule_initial_handshakes(&ctx);
    table.poll(&mut ctx, &mut out);
    flush(&mut ctx, &mut table, &socket, &mut sink, &mut out).await?;

    loop {
        let sleep_for = table
            .next_deadline()
            .map(|deadline| deadline.since(ctx.now))
            .unwrap_or(IDLE_TICK);

        tokio::select! {
            received = socket.recv_from(&mut recv_buf) => {
                let (len, src) = received.context("recv_from failed")?;
                ctx.now = clock(epoch);
                let buf = Buffer::from_vec(recv_buf[..len].to_vec());
                table.handle_datagram(&mut ctx, src, buf, &mut out);
            }
            _ = tokio::time::sleep(sleep_for) => {
                ctx.now = clock(epoch);
                table.poll(&mut ctx, &mut out);
            }
        }

        flush(&mut ctx, &mut table, &socket, &mut sink, &mut out).await?;
    }
}

fn clock(epoch: Instant) -> Timestamp {
    Timestamp::from_millis(epoch.elapsed().as_millis() as u64)
}

/// Carry out the actions one core turn produced.
async fn flush(
    ctx: &mut Context,
    table: &mut PeerTable,
    socket: &UdpSocket,
    sink: &mut impl PayloadSink,
    out: &mut Vec<Output>,
) -> Result<()> {
    for output in out.drain(..) {
        match output {
            Output::Transmit(packet, dest) => {
                if let Err(error) = socket.send_to(packet.as_slice(), dest).await {
                    tracing::debug!(%dest, %error, "send_to failed");
                }
            }
            Output::Deliver(payload) => sink.deliver(payload),
            Output::Resolve(id) => resolve(ctx, table, id).await,
        }
    }
    Ok(())
}

/// Resolve a dynamic peer's hostname and hand the result back to the
/// core, which schedules the deferred handshake.
async fn resolve(ctx: &Context, table: &mut PeerTable, id: usize) {
    let Some(peer) = table.get(id) else { return };
    let PeerAddress::Dynamic { hostname } = peer.config.address.clone() else {
        return;
    };
    let lookup_result = tokio::net::lookup_host(&hostname).await;
    match lookup_result {
        Ok(mut addrs) => {
            if let Some(addr) = addrs.next() {
                tracing::debug!(hostname, %addr, "resolved dynamic peer");
                table.set_resolved(ctx, id, addr);
            } else {
                tracing::debug!(hostname, "hostname resolved to no addresses");
            }
        }
        Err(error) => {
            tracing::debug!(hostname, %error, "hostname resolution failed");
        }
    }
}
