//! End-to-end protocol scenarios.
//!
//! Two in-memory nodes, each with its own deterministic context (seeded
//! RNG, hand-driven clock), wired together by shuttling the core's
//! Transmit outputs across. No sockets, no devices, no sleeping.

use std::net::SocketAddr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use ridge_core::config::Config;
use ridge_core::peer::{Output, PeerAddress, PeerConfig, PeerId};
use ridge_core::{Buffer, Context, Keypair, PeerTable, Timestamp};

// ── Harness ───────────────────────────────────────────────────────────────────

struct Node {
    ctx: Context,
    table: PeerTable,
    addr: SocketAddr,
    out: Vec<Output>,
    delivered: Vec<Vec<u8>>,
}

impl Node {
    fn new(seed: u64, addr: &str, config: Config) -> Node {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        let identity = Keypair::from_secret(secret);
        let ctx = Context::new(config, identity, rng, Timestamp::from_millis(1_000_000))
            .expect("config resolves");
        Node {
            ctx,
            table: PeerTable::new(),
            addr: addr.parse().unwrap(),
            out: Vec::new(),
            delivered: Vec::new(),
        }
    }

    fn public(&self) -> [u8; 32] {
        self.ctx.identity.public
    }

    fn advance(&mut self, by: Duration) {
        self.ctx.advance(by);
    }

    fn dial(&mut self) {
        self.table.schedule_initial_handshakes(&self.ctx);
        self.table.poll(&mut self.ctx, &mut self.out);
    }

    fn poll(&mut self) {
        self.table.poll(&mut self.ctx, &mut self.out);
    }

    fn send(&mut self, peer: PeerId, data: &[u8]) {
        let head = PeerTable::encrypt_head_space(&self.ctx);
        let buf = Buffer::with_head_space(head, data);
        self.table
            .send_payload(&mut self.ctx, peer, buf, &mut self.out);
    }

    fn receive(&mut self, src: SocketAddr, bytes: Vec<u8>) {
        self.table
            .handle_datagram(&mut self.ctx, src, Buffer::from_vec(bytes), &mut self.out);
        let mut remaining = Vec::new();
        for output in self.out.drain(..) {
            match output {
                Output::Deliver(payload) => self.delivered.push(payload.into_vec()),
                other => remaining.push(other),
            }
        }
        self.out = remaining;
    }

    /// Pull pending Transmit outputs; Deliver outputs accumulate into
    /// `delivered` on the way.
    fn take_transmits(&mut self) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut packets = Vec::new();
        for output in self.out.drain(..) {
            match output {
                Output::Transmit(buf, dest) => packets.push((buf.into_vec(), dest)),
                Output::Deliver(payload) => self.delivered.push(payload.into_vec()),
                Output::Resolve(_) => {}
            }
        }
        packets
    }

    fn established(&self, peer: PeerId) -> bool {
        self.table.get(peer).unwrap().is_established()
    }
}

/// Configure the two nodes as each other's fixed peers. Returns the peer
/// id each node uses for the other (0 on both, by construction).
fn link(a: &mut Node, b: &mut Node) -> (PeerId, PeerId) {
    let a_id = b.table.add_peer(PeerConfig {
        key: a.public(),
        address: PeerAddress::Fixed(a.addr),
    });
    let b_id = a.table.add_peer(PeerConfig {
        key: b.public(),
        address: PeerAddress::Fixed(b.addr),
    });
    (b_id, a_id)
}

/// Shuttle packets between the nodes until the link goes quiet.
fn exchange(a: &mut Node, b: &mut Node) {
    loop {
        let mut moved = 0;
        for (bytes, dest) in a.take_transmits() {
            assert_eq!(dest, b.addr, "a sent somewhere unexpected");
            b.receive(a.addr, bytes);
            moved += 1;
        }
        for (bytes, dest) in b.take_transmits() {
            assert_eq!(dest, a.addr, "b sent somewhere unexpected");
            a.receive(b.addr, bytes);
            moved += 1;
        }
        if moved == 0 {
            break;
        }
    }
    // collect any trailing deliveries
    assert!(a.take_transmits().is_empty());
    assert!(b.take_transmits().is_empty());
}

fn pair() -> (Node, Node, PeerId, PeerId) {
    pair_with(Config::default())
}

fn pair_with(config: Config) -> (Node, Node, PeerId, PeerId) {
    let mut a = Node::new(1, "192.0.2.1:655", config.clone());
    let mut b = Node::new(2, "192.0.2.2:655", config);
    let (b_id, a_id) = link(&mut a, &mut b);
    (a, b, b_id, a_id)
}

fn establish(a: &mut Node, b: &mut Node) {
    a.dial();
    exchange(a, b);
    assert!(a.established(0) && b.established(0), "handshake failed");
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

/// A initiates; both sides end established; payload flows.
#[test]
fn clean_handshake() {
    let (mut a, mut b, b_id, _) = pair();
    establish(&mut a, &mut b);

    // exactly one session each, no lingering previous
    assert!(!a.table.has_previous_session(0));
    assert!(!b.table.has_previous_session(0));

    a.send(b_id, b"hello");
    exchange(&mut a, &mut b);
    assert_eq!(b.delivered, vec![b"hello".to_vec()]);
    assert!(a.delivered.is_empty());
}

/// Payload flows the other way too — the two method states are mutual.
#[test]
fn both_directions_after_establishment() {
    let (mut a, mut b, b_id, a_id) = pair();
    establish(&mut a, &mut b);

    a.send(b_id, b"ping");
    exchange(&mut a, &mut b);
    b.send(a_id, b"pong");
    exchange(&mut a, &mut b);

    assert_eq!(b.delivered, vec![b"ping".to_vec()]);
    assert_eq!(a.delivered, vec![b"pong".to_vec()]);
}

/// 16 seconds pass between Init and Respond delivery: the initiator's
/// pool rotates, and the Finish must resolve against the previous slot.
#[test]
fn handshake_key_rollover() {
    let (mut a, mut b, _, _) = pair();

    a.dial();
    let init = a.take_transmits();
    assert_eq!(init.len(), 1);

    a.advance(Duration::from_secs(16));
    b.advance(Duration::from_secs(16));

    for (bytes, _) in init {
        b.receive(a.addr, bytes);
    }
    exchange(&mut a, &mut b);

    assert!(a.established(0), "initiator failed to establish after rollover");
    assert!(b.established(0), "responder failed to establish after rollover");
}

/// A captured data packet replayed verbatim is not delivered twice and
/// does not disturb the session.
#[test]
fn replay_is_rejected() {
    let (mut a, mut b, b_id, _) = pair();
    establish(&mut a, &mut b);

    a.send(b_id, b"secret payload");
    let packets = a.take_transmits();
    assert_eq!(packets.len(), 1);
    let (captured, _) = packets.into_iter().next().unwrap();

    b.receive(a.addr, captured.clone());
    assert_eq!(b.delivered.len(), 1);

    // replay
    b.receive(a.addr, captured);
    assert_eq!(b.delivered.len(), 1, "replayed packet was delivered");

    // the session still works afterwards
    exchange(&mut a, &mut b);
    a.send(b_id, b"fresh");
    exchange(&mut a, &mut b);
    assert_eq!(b.delivered.len(), 2);
}

/// Packets arriving out of order within the window are each delivered
/// exactly once.
#[test]
fn reorder_within_window() {
    let (mut a, mut b, b_id, _) = pair();
    establish(&mut a, &mut b);

    for payload in [&b"p0"[..], b"p1", b"p2", b"p3"] {
        a.send(b_id, payload);
    }
    let packets: Vec<Vec<u8>> = a
        .take_transmits()
        .into_iter()
        .map(|(bytes, _)| bytes)
        .collect();
    assert_eq!(packets.len(), 4);

    // deliver as 0, 2, 1, 3
    for index in [0usize, 2, 1, 3] {
        b.receive(a.addr, packets[index].clone());
    }
    assert_eq!(
        b.delivered,
        vec![b"p0".to_vec(), b"p2".to_vec(), b"p1".to_vec(), b"p3".to_vec()]
    );

    // delivering any of them again is a duplicate
    b.receive(a.addr, packets[1].clone());
    assert_eq!(b.delivered.len(), 4);
}

/// A packet lagging by exactly reorder_count positions is accepted; one
/// position further is rejected.
#[test]
fn reorder_window_boundary() {
    let (mut a, mut b, b_id, _) = pair();
    establish(&mut a, &mut b);

    let count = 64usize; // default reorder_count
    for i in 0..=count + 1 {
        a.send(b_id, format!("m{i}").as_bytes());
    }
    let packets: Vec<Vec<u8>> = a
        .take_transmits()
        .into_iter()
        .map(|(bytes, _)| bytes)
        .collect();

    // newest first: packet[count+1] puts packet[0] just outside the
    // window and packet[1] exactly on its edge
    b.receive(a.addr, packets[count + 1].clone());
    assert_eq!(b.delivered.len(), 1);

    b.receive(a.addr, packets[1].clone());
    assert_eq!(b.delivered.len(), 2, "lag of exactly reorder_count must pass");

    b.receive(a.addr, packets[0].clone());
    assert_eq!(b.delivered.len(), 2, "lag of reorder_count + 1 must be dropped");
}

/// Unknown outer packet types are dropped without delivery, reply, or
/// leak — buffer ownership is move-only, so each iteration fully
/// consumes its allocation.
#[test]
fn unknown_packet_type_flood() {
    let (mut a, mut b, _, _) = pair();
    establish(&mut a, &mut b);

    for i in 0..10_000u32 {
        let mut bytes = vec![0x7f, 0, 0];
        bytes.extend_from_slice(&i.to_le_bytes());
        b.receive(a.addr, bytes);
    }
    assert!(b.delivered.is_empty());
    assert!(b.take_transmits().is_empty());

    // the session survived the noise
    a.send(0, b"still alive");
    exchange(&mut a, &mut b);
    assert_eq!(b.delivered, vec![b"still alive".to_vec()]);
}

/// Initiator-driven rekey: the sessions overlap until the responder's
/// first packet authenticates on the new one, then the old session is
/// gone for good.
#[test]
fn rekey_overlap_window() {
    let mut config = Config::default();
    config.key_refresh = 5;
    config.key_refresh_splay = 0;
    let (mut a, mut b, b_id, _) = pair_with(config);
    establish(&mut a, &mut b);

    a.advance(Duration::from_secs(6));
    b.advance(Duration::from_secs(6));

    // the refresh check fires on the send path and schedules a handshake
    a.send(b_id, b"old session traffic");
    exchange(&mut a, &mut b);
    assert_eq!(b.delivered.len(), 1);

    a.poll();
    let init = a.take_transmits();
    assert_eq!(init.len(), 1, "refresh did not dial");

    // Init → Respond: A establishes the new session, keeping the old as
    // previous
    for (bytes, _) in init {
        b.receive(a.addr, bytes);
    }
    for (bytes, _) in b.take_transmits() {
        a.receive(b.addr, bytes);
    }
    assert!(a.table.has_previous_session(0), "no overlap window");

    // while unconfirmed, A keeps speaking on the previous session, which
    // the responder (still on the old session) can read
    a.send(b_id, b"overlap traffic");
    let overlap = a.take_transmits();
    // first transmit is the Finish, second the payload
    assert_eq!(overlap.len(), 2);
    for (bytes, _) in overlap {
        b.receive(a.addr, bytes);
    }
    exchange(&mut a, &mut b);
    assert_eq!(b.delivered.len(), 2);

    // the responder's keepalive on the new session confirmed it; the
    // previous session is gone on both sides
    assert!(!a.table.has_previous_session(0));
    assert!(!b.table.has_previous_session(0));

    // and traffic now flows on the new session
    a.send(b_id, b"new session traffic");
    exchange(&mut a, &mut b);
    assert_eq!(b.delivered.len(), 3);
}

/// Sessions expire at key_valid; traffic stops and a new handshake is
/// scheduled.
#[test]
fn session_expiry_schedules_rehandshake() {
    let (mut a, mut b, b_id, _) = pair();
    establish(&mut a, &mut b);

    a.advance(Duration::from_secs(3601));
    b.advance(Duration::from_secs(3601));

    a.send(b_id, b"too late");
    assert!(a.take_transmits().is_empty(), "expired session still sent");
    assert!(!a.established(0));

    // the expiry path re-dials, and the peers re-establish
    a.poll();
    exchange(&mut a, &mut b);
    assert!(a.established(0) && b.established(0));

    a.send(b_id, b"back again");
    exchange(&mut a, &mut b);
    assert_eq!(b.delivered, vec![b"back again".to_vec()]);
}

/// Keepalives keep flowing on an idle link, from both sides.
#[test]
fn keepalives_on_idle_link() {
    let (mut a, mut b, _, _) = pair();
    establish(&mut a, &mut b);

    for _ in 0..3 {
        a.advance(Duration::from_secs(11));
        b.advance(Duration::from_secs(11));
        a.poll();
        b.poll();
        let from_a = a.take_transmits();
        let from_b = b.take_transmits();
        assert!(!from_a.is_empty(), "initiator stopped sending keepalives");
        assert!(!from_b.is_empty(), "responder stopped sending keepalives");
        for (bytes, _) in from_a {
            b.receive(a.addr, bytes);
        }
        for (bytes, _) in from_b {
            a.receive(b.addr, bytes);
        }
    }

    // keepalives are consumed by the record layer, never delivered
    assert!(a.delivered.is_empty());
    assert!(b.delivered.is_empty());
    assert!(a.established(0) && b.established(0));
}

/// Random byte strings through the receive path: no panic, no reply, no
/// delivery. Forging a packet that authenticates is not going to happen
/// by accident.
#[test]
fn random_noise_is_survivable() {
    let (mut a, mut b, b_id, _) = pair();
    establish(&mut a, &mut b);

    let mut rng = StdRng::seed_from_u64(0xbad_c0de);
    for _ in 0..2_000 {
        let len = (rng.next_u32() % 96) as usize;
        let mut bytes = vec![0u8; len];
        rng.fill_bytes(&mut bytes);
        b.receive(a.addr, bytes);
    }
    assert!(b.delivered.is_empty());
    assert!(b.take_transmits().is_empty(), "noise provoked a reply");

    a.send(b_id, b"after the storm");
    exchange(&mut a, &mut b);
    assert_eq!(b.delivered, vec![b"after the storm".to_vec()]);
}

/// A handshake from a key nobody configured is ignored entirely.
#[test]
fn unknown_sender_key_is_dropped() {
    let (mut a, mut b, _, _) = pair();

    // mallory shares a's address but not a's key
    let mut mallory = Node::new(99, "192.0.2.1:655", Config::default());
    mallory.table.add_peer(PeerConfig {
        key: b.public(),
        address: PeerAddress::Fixed(b.addr),
    });
    mallory.dial();

    for (bytes, _) in mallory.take_transmits() {
        b.receive(mallory.addr, bytes);
    }
    assert!(b.take_transmits().is_empty(), "b answered an unknown key");
    assert!(!b.established(0));

    // the legitimate peers are unaffected
    establish(&mut a, &mut b);
}
