//! Peer glue — configured peers, packet dispatch, and timers.
//!
//! The [`PeerTable`] is the core's outward face. The daemon feeds it
//! datagrams and clock ticks; it hands back [`Output`] actions: datagrams
//! to transmit, payloads to deliver to the TUN side, and resolution
//! requests for dynamic peers. Nothing in here touches a socket.
//!
//! Every inbound buffer is consumed by value and either forwarded or
//! dropped on each path — including the unknown-packet-type branch at the
//! outermost dispatch.

use std::net::SocketAddr;
use std::time::Duration;

use crate::buffer::Buffer;
use crate::config::{ConfigError, PeerEntry};
use crate::context::Context;
use crate::crypto::{SessionSecret, KEY_BYTES};
use crate::handshake::{self, HandshakeError, HandshakeProgress};
use crate::method::MethodError;
use crate::session::{DecryptOutcome, Session, SessionPair};
use crate::time::Timestamp;
use crate::wire::{
    HandshakeRecords, RecordType, PACKET_DATA, PACKET_HANDSHAKE, PACKET_HEADER_BYTES,
};

/// Retry cadence while a handshake is outstanding.
const HANDSHAKE_RETRY: Duration = Duration::from_secs(15);

pub type PeerId = usize;

/// How a configured peer is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddress {
    /// Configured remote endpoint; also what address claims are checked
    /// against.
    Fixed(SocketAddr),
    /// No configured endpoint — handshakes are accepted from anywhere.
    Float,
    /// Endpoint comes from name resolution at handshake time.
    Dynamic { hostname: String },
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub key: [u8; KEY_BYTES],
    pub address: PeerAddress,
}

pub struct Peer {
    pub config: PeerConfig,
    /// Address bound by the last authenticated handshake.
    remote: Option<SocketAddr>,
    /// Latest resolution result for dynamic peers.
    resolved: Option<SocketAddr>,
    established_at: Option<Timestamp>,
    sessions: SessionPair,
    progress: Option<HandshakeProgress>,
    next_handshake: Option<Timestamp>,
    next_keepalive: Option<Timestamp>,
}

impl Peer {
    fn new(config: PeerConfig) -> Peer {
        Peer {
            config,
            remote: None,
            resolved: None,
            established_at: None,
            sessions: SessionPair::new(),
            progress: None,
            next_handshake: None,
            next_keepalive: None,
        }
    }

    pub fn is_established(&self) -> bool {
        self.established_at.is_some()
    }

    /// Where to send packets for this peer, if known.
    fn address(&self) -> Option<SocketAddr> {
        self.remote.or(match &self.config.address {
            PeerAddress::Fixed(addr) => Some(*addr),
            PeerAddress::Dynamic { .. } => self.resolved,
            PeerAddress::Float => None,
        })
    }

    fn matches_address(&self, addr: SocketAddr) -> bool {
        self.remote == Some(addr)
            || matches!(self.config.address, PeerAddress::Fixed(fixed) if fixed == addr)
    }

    /// Fixed peers own their configured address for claim purposes.
    fn owns_address(&self, addr: SocketAddr) -> bool {
        matches!(self.config.address, PeerAddress::Fixed(fixed) if fixed == addr)
    }

    /// Coalescing schedule: an earlier pending handshake wins.
    fn schedule_handshake(&mut self, at: Timestamp) {
        self.next_handshake = Some(match self.next_handshake {
            Some(pending) if pending <= at => pending,
            _ => at,
        });
    }

    /// Initiator-side rekey check, run on the send, receive, and timer
    /// paths. Sets `refreshing` so the rekey is dialed only once.
    fn check_refresh(&mut self, now: Timestamp) {
        let due = self.sessions.current_mut().is_some_and(|current| {
            if !current.refreshing && current.want_refresh(now) {
                current.refreshing = true;
                true
            } else {
                false
            }
        });
        if due {
            tracing::debug!(
                peer = hex::encode(self.config.key),
                "session wants refresh, scheduling handshake"
            );
            self.schedule_handshake(now);
        }
    }
}

/// What the core wants the daemon to do.
pub enum Output {
    /// Send this datagram to this address.
    Transmit(Buffer, SocketAddr),
    /// Hand this decrypted payload to the TUN side.
    Deliver(Buffer),
    /// Resolve this dynamic peer's hostname, then call `set_resolved`.
    Resolve(PeerId),
}

enum SenderMatch {
    Known(PeerId),
    Deferred(PeerId),
    Unknown,
}

#[derive(Default)]
pub struct PeerTable {
    peers: Vec<Peer>,
}

impl PeerTable {
    pub fn new() -> PeerTable {
        PeerTable::default()
    }

    /// Build the table from config entries. Peers with unusable keys are
    /// disabled with a warning; a peer carrying our own key aborts
    /// startup.
    pub fn from_entries(
        entries: &[PeerEntry],
        own_public: &[u8; KEY_BYTES],
    ) -> Result<PeerTable, ConfigError> {
        let mut table = PeerTable::new();
        for entry in entries {
            let mut key = [0u8; KEY_BYTES];
            if hex::decode_to_slice(&entry.key, &mut key).is_err() {
                tracing::warn!(key = entry.key, "peer key is not 64 hex digits, disabling peer");
                continue;
            }
            if key == *own_public {
                return Err(ConfigError::PeerKeyIsOwn(entry.key.clone()));
            }
            let address = if entry.float {
                PeerAddress::Float
            } else if let Some(hostname) = &entry.hostname {
                PeerAddress::Dynamic {
                    hostname: hostname.clone(),
                }
            } else if let Some(addr) = entry.address {
                PeerAddress::Fixed(addr)
            } else {
                tracing::warn!(
                    key = entry.key,
                    "peer has no address and does not float, disabling peer"
                );
                continue;
            };
            table.add_peer(PeerConfig { key, address });
        }
        Ok(table)
    }

    pub fn add_peer(&mut self, config: PeerConfig) -> PeerId {
        self.peers.push(Peer::new(config));
        self.peers.len() - 1
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peer_by_key(&self, key: &[u8; KEY_BYTES]) -> Option<PeerId> {
        self.peers.iter().position(|p| p.config.key == *key)
    }

    /// True while the peer's current and previous sessions overlap.
    pub fn has_previous_session(&self, id: PeerId) -> bool {
        self.peers[id].sessions.has_previous()
    }

    /// Head space outbound payload buffers must carry.
    pub fn encrypt_head_space(ctx: &Context) -> usize {
        PACKET_HEADER_BYTES + ctx.method.min_encrypt_head_space()
    }

    /// Kick off handshakes for every peer whose address is already known.
    /// Floating peers wait for the remote side to dial.
    pub fn schedule_initial_handshakes(&mut self, ctx: &Context) {
        for peer in &mut self.peers {
            if peer.address().is_some() {
                peer.schedule_handshake(ctx.now);
            }
        }
    }

    /// The earliest pending timer across all peers.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.peers
            .iter()
            .flat_map(|p| [p.next_handshake, p.next_keepalive])
            .flatten()
            .min()
    }

    /// A dynamic peer's hostname resolved.
    pub fn set_resolved(&mut self, ctx: &Context, id: PeerId, addr: SocketAddr) {
        let peer = &mut self.peers[id];
        peer.resolved = Some(addr);
        if !peer.is_established() {
            peer.schedule_handshake(ctx.now);
        }
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    /// The outermost packet dispatch. Consumes the buffer on every path.
    pub fn handle_datagram(
        &mut self,
        ctx: &mut Context,
        src: SocketAddr,
        buf: Buffer,
        out: &mut Vec<Output>,
    ) {
        match buf.as_slice().first() {
            Some(&PACKET_HANDSHAKE) => self.handle_handshake(ctx, src, buf, out),
            Some(&PACKET_DATA) => self.handle_data(ctx, src, buf, out),
            Some(&other) => {
                tracing::debug!(packet_type = other, %src, "dropping packet with unknown type");
            }
            None => {
                tracing::debug!(%src, "dropping empty datagram");
            }
        }
    }

    fn handle_handshake(
        &mut self,
        ctx: &mut Context,
        src: SocketAddr,
        buf: Buffer,
        out: &mut Vec<Output>,
    ) {
        if buf.len() < PACKET_HEADER_BYTES {
            tracing::debug!(%src, "dropping truncated handshake packet");
            return;
        }
        let records = match HandshakeRecords::parse(&buf.as_slice()[PACKET_HEADER_BYTES..]) {
            Ok(records) => records,
            Err(error) => {
                tracing::debug!(%src, %error, "dropping malformed handshake");
                return;
            }
        };
        drop(buf);

        let handshake_type = match handshake::handshake_type(&records) {
            Ok(ty) => ty,
            Err(error) => {
                tracing::debug!(%src, %error, "dropping handshake");
                return;
            }
        };
        let Some(sender_key) = records.get_key(RecordType::SenderKey) else {
            tracing::debug!(%src, "dropping handshake without sender key");
            return;
        };
        let sender_key = *sender_key;

        match self.match_sender(ctx, src, &sender_key) {
            SenderMatch::Known(id) => {
                self.dispatch_handshake(ctx, id, src, handshake_type, &records, out);
            }
            SenderMatch::Deferred(id) => {
                tracing::debug!(%src, "deferring handshake until address resolution");
                out.push(Output::Resolve(id));
            }
            SenderMatch::Unknown => {
                tracing::debug!(
                    %src,
                    key = hex::encode(sender_key),
                    "handshake from unknown sender key"
                );
            }
        }
    }

    /// Sender-key matching: the address-associated peer first, then
    /// floating and dynamic peers. Our own key never matches.
    fn match_sender(
        &self,
        ctx: &Context,
        src: SocketAddr,
        key: &[u8; KEY_BYTES],
    ) -> SenderMatch {
        if *key == ctx.identity.public {
            return SenderMatch::Unknown;
        }

        if let Some(id) = self.peers.iter().position(|p| p.matches_address(src)) {
            if self.peers[id].config.key == *key {
                return SenderMatch::Known(id);
            }
        }

        for (id, peer) in self.peers.iter().enumerate() {
            if peer.config.key != *key {
                continue;
            }
            match &peer.config.address {
                PeerAddress::Float => return SenderMatch::Known(id),
                PeerAddress::Dynamic { .. } => {
                    return if peer.resolved == Some(src) {
                        SenderMatch::Known(id)
                    } else {
                        SenderMatch::Deferred(id)
                    };
                }
                PeerAddress::Fixed(_) => {}
            }
        }
        SenderMatch::Unknown
    }

    fn dispatch_handshake(
        &mut self,
        ctx: &mut Context,
        id: PeerId,
        src: SocketAddr,
        handshake_type: u8,
        records: &HandshakeRecords,
        out: &mut Vec<Output>,
    ) {
        let peer_key = self.peers[id].config.key;
        match handshake_type {
            handshake::TYPE_INIT => match handshake::respond(ctx, records, &peer_key) {
                Ok((reply, progress)) => {
                    self.peers[id].progress = Some(progress);
                    out.push(Output::Transmit(reply, src));
                }
                Err(error) => log_handshake_error(error, src),
            },
            handshake::TYPE_RESPOND => {
                let Some(progress) = self.peers[id].progress.as_ref() else {
                    tracing::debug!(%src, "dropping unsolicited handshake response");
                    return;
                };
                match handshake::finish(ctx, records, progress, &peer_key) {
                    Ok((finish_msg, secret)) => {
                        out.push(Output::Transmit(finish_msg, src));
                        self.establish(ctx, id, src, true, secret, out);
                    }
                    Err(error) => log_handshake_error(error, src),
                }
            }
            handshake::TYPE_FINISH => {
                let Some(progress) = self.peers[id].progress.as_ref() else {
                    tracing::debug!(%src, "dropping handshake finish without pending response");
                    return;
                };
                match handshake::complete(ctx, records, progress, &peer_key) {
                    Ok(secret) => self.establish(ctx, id, src, false, secret, out),
                    Err(error) => log_handshake_error(error, src),
                }
            }
            other => {
                tracing::debug!(handshake_type = other, %src, "dropping unknown handshake type");
            }
        }
    }

    // ── Establishment ─────────────────────────────────────────────────────────

    /// A handshake completed: claim the address, roll the session pair
    /// over, install the fresh method state.
    fn establish(
        &mut self,
        ctx: &mut Context,
        id: PeerId,
        remote: SocketAddr,
        initiator: bool,
        secret: SessionSecret,
        out: &mut Vec<Output>,
    ) {
        let conflict = self
            .peers
            .iter()
            .enumerate()
            .any(|(other, peer)| other != id && peer.owns_address(remote));
        if conflict {
            tracing::warn!(
                %remote,
                peer = hex::encode(self.peers[id].config.key),
                "address already owned by a fixed peer, resetting"
            );
            self.reset_peer(id);
            return;
        }

        let method = ctx.method;
        let session = Session::new(method.session_init(ctx, &secret, initiator));

        let peer = &mut self.peers[id];
        peer.remote = Some(remote);
        peer.sessions.rollover(ctx.now);
        peer.sessions.set_current(session);
        peer.progress = None;
        peer.established_at = Some(ctx.now);
        peer.next_keepalive = Some(ctx.now + ctx.config.keepalive_interval());

        tracing::info!(
            peer = hex::encode(peer.config.key),
            %remote,
            initiator,
            "session established"
        );

        // prove liveness to the initiator right away
        if !initiator {
            self.send_keepalive(ctx, id, out);
        }
    }

    /// Drop all state for a peer. Scheduled timers die with it.
    pub fn reset_peer(&mut self, id: PeerId) {
        let peer = &mut self.peers[id];
        peer.sessions.clear();
        peer.progress = None;
        peer.established_at = None;
        peer.remote = None;
        peer.next_handshake = None;
        peer.next_keepalive = None;
    }

    /// Lazy expiry: when the current session dies, tear the peer down and
    /// dial again if we know where to.
    fn expire_peer(&mut self, ctx: &Context, id: PeerId) {
        let peer = &mut self.peers[id];
        if peer.sessions.expire(ctx.now) {
            peer.established_at = None;
            peer.next_keepalive = None;
            tracing::info!(peer = hex::encode(peer.config.key), "session expired");
            if peer.address().is_some() {
                peer.schedule_handshake(ctx.now);
            }
        }
    }

    // ── Send path ─────────────────────────────────────────────────────────────

    /// Encrypt and emit one payload. The payload buffer must carry
    /// [`encrypt_head_space`](Self::encrypt_head_space) bytes of head room.
    pub fn send_payload(
        &mut self,
        ctx: &mut Context,
        id: PeerId,
        payload: Buffer,
        out: &mut Vec<Output>,
    ) {
        let now = ctx.now;
        self.expire_peer(ctx, id);
        let peer = &mut self.peers[id];

        if !peer.is_established() || !peer.sessions.is_usable(now) {
            tracing::debug!(
                peer = hex::encode(peer.config.key),
                "no valid session, dropping outbound packet"
            );
            return;
        }

        peer.check_refresh(now);

        let Some(addr) = peer.remote else {
            tracing::debug!("established peer without remote address, dropping packet");
            return;
        };
        let Some(session) = peer.sessions.select_for_send(now) else {
            tracing::debug!("no session selectable for send, dropping packet");
            return;
        };

        match session.encrypt(payload) {
            Ok(mut packet) => {
                packet.push_head(&[PACKET_DATA, 0, 0]);
                out.push(Output::Transmit(packet, addr));
                peer.next_keepalive = Some(now + ctx.config.keepalive_interval());
            }
            Err(error) => {
                tracing::debug!(%error, "encrypt failed, dropping packet");
            }
        }
    }

    fn send_keepalive(&mut self, ctx: &mut Context, id: PeerId, out: &mut Vec<Output>) {
        let buf = Buffer::empty_with_head_space(Self::encrypt_head_space(ctx));
        self.send_payload(ctx, id, buf, out);
    }

    // ── Receive path ──────────────────────────────────────────────────────────

    fn handle_data(
        &mut self,
        ctx: &mut Context,
        src: SocketAddr,
        buf: Buffer,
        out: &mut Vec<Output>,
    ) {
        let now = ctx.now;
        if buf.len() < PACKET_HEADER_BYTES {
            tracing::debug!(%src, "dropping truncated data packet");
            return;
        }
        let Some(id) = self.peers.iter().position(|p| p.matches_address(src)) else {
            tracing::debug!(%src, "data packet from unknown address");
            return;
        };
        self.expire_peer(ctx, id);

        if !self.peers[id].is_established() {
            tracing::debug!(%src, "data packet without established session, scheduling handshake");
            self.peers[id].schedule_handshake(now);
            return;
        }

        let outcome = self.peers[id]
            .sessions
            .decrypt(now, &buf.as_slice()[PACKET_HEADER_BYTES..]);
        drop(buf);

        match outcome {
            DecryptOutcome::Current(plaintext) => {
                let peer = &mut self.peers[id];
                let newly_confirmed = peer
                    .sessions
                    .current()
                    .is_some_and(|c| !c.handshakes_cleaned);
                let mut confirm = false;
                if newly_confirmed {
                    // the peer provably speaks the new session: stop
                    // handshake retries and retire the old session
                    peer.next_handshake = None;
                    peer.sessions.drop_previous();
                    if let Some(current) = peer.sessions.current_mut() {
                        current.handshakes_cleaned = true;
                        confirm = current.is_initiator();
                    }
                }
                peer.check_refresh(now);
                if confirm {
                    self.send_keepalive(ctx, id, out);
                }
                deliver(plaintext, out);
            }
            DecryptOutcome::Previous(plaintext) => {
                deliver(plaintext, out);
            }
            DecryptOutcome::Failed(error) => match error {
                Some(MethodError::Replay) | Some(MethodError::BadNonce) => {
                    tracing::debug!(%src, "dropping duplicate or out-of-window packet");
                }
                _ => {
                    tracing::debug!(%src, "data packet verification failed");
                }
            },
        }
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    /// Fire every due timer: handshake retries and keepalives.
    pub fn poll(&mut self, ctx: &mut Context, out: &mut Vec<Output>) {
        let now = ctx.now;
        for id in 0..self.peers.len() {
            self.expire_peer(ctx, id);
            self.peers[id].check_refresh(now);

            if self.peers[id]
                .next_handshake
                .is_some_and(|at| at <= now)
            {
                self.initiate_handshake(ctx, id, out);
            }

            if self.peers[id].is_established()
                && self.peers[id]
                    .next_keepalive
                    .is_some_and(|at| at <= now)
            {
                self.send_keepalive(ctx, id, out);
            }
        }
    }

    fn initiate_handshake(&mut self, ctx: &mut Context, id: PeerId, out: &mut Vec<Output>) {
        let Some(addr) = self.peers[id].address() else {
            self.peers[id].next_handshake = None;
            return;
        };
        let key = self.peers[id].config.key;
        let (init, progress) = handshake::start(ctx, Some(&key));

        let peer = &mut self.peers[id];
        peer.progress = Some(progress);
        peer.next_handshake = Some(ctx.now + HANDSHAKE_RETRY);
        tracing::debug!(peer = hex::encode(key), %addr, "sending handshake");
        out.push(Output::Transmit(init, addr));
    }
}

fn deliver(plaintext: Buffer, out: &mut Vec<Output>) {
    if plaintext.is_empty() {
        // keepalive — consumed here
        return;
    }
    out.push(Output::Deliver(plaintext));
}

fn log_handshake_error(error: HandshakeError, src: SocketAddr) {
    match error {
        HandshakeError::TagMismatch => {
            tracing::warn!(%src, "handshake tag verification failed");
        }
        // degenerate points are dropped without a trace
        HandshakeError::DegeneratePoint => {}
        error => {
            tracing::debug!(%src, %error, "dropping handshake");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
