//! The EC25519-FHMQVC handshake.
//!
//! Three messages establish a mutually authenticated session:
//!
//!   1. Init    (initiator → responder): A, [B], X
//!   2. Respond (responder → initiator): A, B, Y, X, T
//!   3. Finish  (initiator → responder): A, B, X, Y, T
//!
//! where A/B are the long-term public keys, X/Y the ephemeral handshake
//! keys, and T the authenticator. Both sides derive the combined secret
//! FHMQV-style: hashed scalars `d`, `e` from `SHA256(X‖Y‖A‖B)` fold the
//! long-term and ephemeral keys into a single point σ, and the session
//! secret is `SHA256(X‖Y‖A‖B‖σ)`.
//!
//! Per-peer progress is an explicit state machine — `Initiated` on the
//! dialing side, `Responded` on the answering side — and every transition
//! is gated on tag verification. Errors never produce a reply; a silent
//! drop denies an oracle to whoever is probing.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, RngCore};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::buffer::Buffer;
use crate::context::Context;
use crate::crypto::{self, Point, SessionSecret, KEY_BYTES};
use crate::identity::Keypair;
use crate::time::Timestamp;
use crate::wire::{HandshakeBuilder, HandshakeRecords, RecordType};

/// Protocol name carried and verified in every handshake message.
pub const PROTOCOL_NAME: &[u8] = b"ec25519-fhmqvc";

pub const TYPE_INIT: u8 = 1;
pub const TYPE_RESPOND: u8 = 2;
pub const TYPE_FINISH: u8 = 3;

/// How long a handshake key is used for new handshakes.
const KEY_PREFERRED: Duration = Duration::from_secs(15);
/// How long a handshake key still resolves in-flight responses.
const KEY_VALID: Duration = Duration::from_secs(30);

// ── Handshake-key pool ────────────────────────────────────────────────────────

/// A short-lived Curve25519 keypair for one or a few key agreements.
pub struct HandshakeKey {
    secret: Zeroizing<[u8; KEY_BYTES]>,
    pub public: [u8; KEY_BYTES],
    preferred_till: Timestamp,
    valid_till: Timestamp,
}

impl HandshakeKey {
    fn generate(rng: &mut StdRng, now: Timestamp) -> HandshakeKey {
        let mut secret = Zeroizing::new([0u8; KEY_BYTES]);
        rng.fill_bytes(&mut secret[..]);
        crypto::secret_sanitize(&mut secret);
        let public = crypto::scalar_base_mult(&crypto::scalar_load(&secret)).encode();
        HandshakeKey {
            secret,
            public,
            preferred_till: now + KEY_PREFERRED,
            valid_till: now + KEY_VALID,
        }
    }

    fn is_preferred(&self, now: Timestamp) -> bool {
        now < self.preferred_till
    }

    fn is_valid(&self, now: Timestamp) -> bool {
        now < self.valid_till
    }
}

/// Exactly two slots: the current key and the one it replaced. In-flight
/// responses to the previous key keep resolving for its remaining
/// validity (at least 15 seconds after rotation).
pub struct HandshakeKeyPool {
    current: Option<HandshakeKey>,
    previous: Option<HandshakeKey>,
}

impl HandshakeKeyPool {
    pub fn new() -> HandshakeKeyPool {
        HandshakeKeyPool {
            current: None,
            previous: None,
        }
    }

    /// Lazy maintenance, run on every handshake path: once the current key
    /// is no longer preferred, rotate. The displaced previous slot is
    /// zeroed on drop.
    pub fn maintain(&mut self, rng: &mut StdRng, now: Timestamp) {
        let rotate = match &self.current {
            Some(key) => !key.is_preferred(now),
            None => true,
        };
        if rotate {
            self.previous = self.current.take();
            self.current = Some(HandshakeKey::generate(rng, now));
        }
    }

    /// The key new handshakes use. Valid only after `maintain`.
    pub fn current(&self) -> &HandshakeKey {
        self.current.as_ref().expect("handshake-key pool maintained")
    }

    /// Resolve a public half against the current, then the previous slot.
    /// Expired entries never match.
    pub fn lookup(&self, public: &[u8; KEY_BYTES], now: Timestamp) -> Option<&HandshakeKey> {
        [self.current.as_ref(), self.previous.as_ref()]
            .into_iter()
            .flatten()
            .find(|key| key.public == *public && key.is_valid(now))
    }
}

// ── Per-peer progress ─────────────────────────────────────────────────────────

/// Explicit handshake state kept on the peer between messages. The
/// terminal state is the established session itself.
#[derive(Debug)]
pub enum HandshakeProgress {
    /// We sent an Init and await the Respond.
    Initiated { request_id: u8 },
    /// We answered an Init and await the Finish. The derived secret is
    /// cached so the Finish does not repeat the scalar arithmetic.
    Responded {
        request_id: u8,
        local_handshake: [u8; KEY_BYTES],
        peer_handshake: [u8; KEY_BYTES],
        secret: SessionSecret,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("missing or malformed {0:?} record")]
    BadRecord(RecordType),

    #[error("unknown handshake type {0}")]
    UnknownType(u8),

    #[error("handshake for a different protocol")]
    ProtocolMismatch,

    #[error("tunnel mode mismatch")]
    ModeMismatch,

    #[error("handshake addressed to a different key")]
    NotForUs,

    #[error("peer signalled reply code {0}")]
    PeerError(u8),

    #[error("no valid handshake key matches")]
    NoHandshakeKey,

    #[error("degenerate curve point")]
    DegeneratePoint,

    #[error("handshake tag verification failed")]
    TagMismatch,

    #[error("message does not fit the handshake state")]
    UnexpectedState,
}

// ── Key agreement ─────────────────────────────────────────────────────────────

/// The FHMQV combined computation, from either side.
///
/// Returns `None` when σ collapses to the group identity — small-subgroup
/// probes and garbage encodings end here, silently.
fn derive_shared(
    initiator: bool,
    identity: &Keypair,
    handshake_key: &HandshakeKey,
    peer_key: &[u8; KEY_BYTES],
    peer_handshake: &[u8; KEY_BYTES],
) -> Option<SessionSecret> {
    let (x_pub, y_pub, a_pub, b_pub) = if initiator {
        (&handshake_key.public, peer_handshake, &identity.public, peer_key)
    } else {
        (peer_handshake, &handshake_key.public, peer_key, &identity.public)
    };

    let h = crypto::sha256(&[&x_pub[..], &y_pub[..], &a_pub[..], &b_pub[..]]);

    // d and e are the 128-bit halves of h with their top bit forced, loaded
    // little-endian as scalars.
    let mut d_bytes = [0u8; KEY_BYTES];
    d_bytes[..16].copy_from_slice(&h[..16]);
    d_bytes[15] |= 0x80;
    let mut e_bytes = [0u8; KEY_BYTES];
    e_bytes[..16].copy_from_slice(&h[16..]);
    e_bytes[15] |= 0x80;
    let d = crypto::scalar_load(&d_bytes);
    let e = crypto::scalar_load(&e_bytes);

    let own_key = crypto::scalar_load(identity.secret());
    let own_handshake = crypto::scalar_load(&handshake_key.secret);

    // initiator: s = d·a + x, σ = s·(e·B + Y)
    // responder: s = e·b + y, σ = s·(d·A + X)
    let (s, peer_factor) = if initiator {
        (crypto::scalar_mul_add(&d, &own_key, &own_handshake), e)
    } else {
        (crypto::scalar_mul_add(&e, &own_key, &own_handshake), d)
    };

    let peer_key_point = Point::decode(peer_key);
    let peer_handshake_point = Point::decode(peer_handshake);
    let sigma = crypto::scalar_mult(
        &s,
        &crypto::point_add(
            &crypto::scalar_mult(&peer_factor, &peer_key_point),
            &peer_handshake_point,
        ),
    );
    if sigma.is_identity() {
        return None;
    }

    let secret = crypto::sha256(&[
        &x_pub[..],
        &y_pub[..],
        &a_pub[..],
        &b_pub[..],
        &sigma.encode()[..],
    ]);
    Some(SessionSecret::new(secret))
}

/// The authenticator both Respond and Finish carry: `HMAC_K(A ‖ Y)` over
/// the initiator's long-term key and the responder's handshake key. The
/// two messages deliberately carry the same tag value — this is the
/// three-message FHMQV shape, not a four-message variant.
fn protocol_tag(
    secret: &SessionSecret,
    initiator_key: &[u8; KEY_BYTES],
    responder_handshake: &[u8; KEY_BYTES],
) -> [u8; 32] {
    crypto::hmac_sha256(
        secret.as_bytes(),
        &[&initiator_key[..], &responder_handshake[..]],
    )
}

fn verify_protocol_tag(
    tag: &[u8; 32],
    secret: &SessionSecret,
    initiator_key: &[u8; KEY_BYTES],
    responder_handshake: &[u8; KEY_BYTES],
) -> bool {
    crypto::hmac_sha256_verify(
        tag,
        secret.as_bytes(),
        &[&initiator_key[..], &responder_handshake[..]],
    )
}

// ── Record validation ─────────────────────────────────────────────────────────

/// The key-bearing records of one message, length-checked before any
/// cryptography runs.
struct MessageKeys<'a> {
    sender_key: &'a [u8; KEY_BYTES],
    sender_handshake: &'a [u8; KEY_BYTES],
    recipient_handshake: Option<&'a [u8; KEY_BYTES]>,
    tag: Option<&'a [u8; 32]>,
}

pub fn handshake_type(records: &HandshakeRecords) -> Result<u8, HandshakeError> {
    records
        .get_u8(RecordType::HandshakeType)
        .ok_or(HandshakeError::BadRecord(RecordType::HandshakeType))
}

/// Presence and length checks common to all three messages. `full` adds
/// the requirements of Respond and Finish: recipient key equal to ours,
/// recipient handshake key, and the tag.
fn validate<'a>(
    ctx: &Context,
    records: &'a HandshakeRecords,
    full: bool,
) -> Result<MessageKeys<'a>, HandshakeError> {
    match records.get(RecordType::ProtocolName) {
        Some(name) if name == PROTOCOL_NAME => {}
        _ => return Err(HandshakeError::ProtocolMismatch),
    }
    if let Some(mode) = records.get_u8(RecordType::Mode) {
        if mode != ctx.config.mode.wire_byte() {
            return Err(HandshakeError::ModeMismatch);
        }
    }
    if let Some(code) = records.get_u8(RecordType::ReplyCode) {
        if code != 0 {
            return Err(HandshakeError::PeerError(code));
        }
    }

    let sender_key = records
        .get_key(RecordType::SenderKey)
        .ok_or(HandshakeError::BadRecord(RecordType::SenderKey))?;
    let sender_handshake = records
        .get_key(RecordType::SenderHandshakeKey)
        .ok_or(HandshakeError::BadRecord(RecordType::SenderHandshakeKey))?;

    // Init may omit the recipient key when the responder's identity is not
    // yet known; Respond and Finish must name us.
    match records.get(RecordType::RecipientKey) {
        Some(key) if key == ctx.identity.public => {}
        Some(_) => return Err(HandshakeError::NotForUs),
        None if full => return Err(HandshakeError::BadRecord(RecordType::RecipientKey)),
        None => {}
    }

    let recipient_handshake = match records.get_key(RecordType::RecipientHandshakeKey) {
        Some(key) => Some(key),
        None if full => {
            return Err(HandshakeError::BadRecord(RecordType::RecipientHandshakeKey))
        }
        None => None,
    };
    let tag = match records.get_key(RecordType::AuthTag) {
        Some(tag) => Some(tag),
        None if full => return Err(HandshakeError::BadRecord(RecordType::AuthTag)),
        None => None,
    };

    Ok(MessageKeys {
        sender_key,
        sender_handshake,
        recipient_handshake,
        tag,
    })
}

fn base_message(ctx: &Context, request_id: u8, handshake_type: u8) -> HandshakeBuilder {
    let mut builder = HandshakeBuilder::new(request_id);
    builder
        .add_u8(RecordType::HandshakeType, handshake_type)
        .add_u8(RecordType::Mode, ctx.config.mode.wire_byte())
        .add(RecordType::ProtocolName, PROTOCOL_NAME);
    builder
}

// ── The three messages ────────────────────────────────────────────────────────

/// Begin a handshake: rotate the key pool if due, build the Init message.
pub fn start(ctx: &mut Context, peer_key: Option<&[u8; KEY_BYTES]>) -> (Buffer, HandshakeProgress) {
    let request_id = ctx.rng.gen();
    let Context {
        pool, rng, now, ..
    } = ctx;
    pool.maintain(rng, *now);

    let mut builder = base_message(ctx, request_id, TYPE_INIT);
    builder.add(RecordType::SenderKey, &ctx.identity.public);
    if let Some(key) = peer_key {
        builder.add(RecordType::RecipientKey, key);
    }
    builder.add(RecordType::SenderHandshakeKey, &ctx.pool.current().public);

    (builder.finish(), HandshakeProgress::Initiated { request_id })
}

/// Handle an Init as the responder: derive the shared secret and build
/// the Respond message. `peer_key` is the configured key the sender
/// matched against.
pub fn respond(
    ctx: &mut Context,
    records: &HandshakeRecords,
    peer_key: &[u8; KEY_BYTES],
) -> Result<(Buffer, HandshakeProgress), HandshakeError> {
    let keys = validate(ctx, records, false)?;
    debug_assert_eq!(keys.sender_key, peer_key);
    let peer_handshake = *keys.sender_handshake;

    let Context {
        pool, rng, now, ..
    } = ctx;
    pool.maintain(rng, *now);

    let secret = derive_shared(
        false,
        &ctx.identity,
        ctx.pool.current(),
        peer_key,
        &peer_handshake,
    )
    .ok_or(HandshakeError::DegeneratePoint)?;

    let local_handshake = ctx.pool.current().public;
    let tag = protocol_tag(&secret, peer_key, &local_handshake);

    let mut builder = base_message(ctx, records.request_id, TYPE_RESPOND);
    builder
        .add_u8(RecordType::ReplyCode, 0)
        .add(RecordType::SenderKey, &ctx.identity.public)
        .add(RecordType::RecipientKey, peer_key)
        .add(RecordType::SenderHandshakeKey, &local_handshake)
        .add(RecordType::RecipientHandshakeKey, &peer_handshake)
        .add(RecordType::AuthTag, &tag);

    Ok((
        builder.finish(),
        HandshakeProgress::Responded {
            request_id: records.request_id,
            local_handshake,
            peer_handshake,
            secret,
        },
    ))
}

/// Handle a Respond as the initiator: verify the responder's tag, build
/// the Finish message, and hand back the session secret.
pub fn finish(
    ctx: &mut Context,
    records: &HandshakeRecords,
    progress: &HandshakeProgress,
    peer_key: &[u8; KEY_BYTES],
) -> Result<(Buffer, SessionSecret), HandshakeError> {
    let request_id = match progress {
        HandshakeProgress::Initiated { request_id } => *request_id,
        HandshakeProgress::Responded { .. } => return Err(HandshakeError::UnexpectedState),
    };
    if records.request_id != request_id {
        return Err(HandshakeError::UnexpectedState);
    }

    let keys = validate(ctx, records, true)?;
    let peer_handshake = *keys.sender_handshake;
    let own_handshake = keys.recipient_handshake.expect("validated");
    let tag = keys.tag.expect("validated");

    let Context {
        pool, rng, now, ..
    } = ctx;
    pool.maintain(rng, *now);

    let handshake_key = ctx
        .pool
        .lookup(own_handshake, ctx.now)
        .ok_or(HandshakeError::NoHandshakeKey)?;

    let secret = derive_shared(true, &ctx.identity, handshake_key, peer_key, &peer_handshake)
        .ok_or(HandshakeError::DegeneratePoint)?;

    if !verify_protocol_tag(tag, &secret, &ctx.identity.public, &peer_handshake) {
        return Err(HandshakeError::TagMismatch);
    }

    let reply_tag = protocol_tag(&secret, &ctx.identity.public, &peer_handshake);
    let local_handshake = handshake_key.public;

    let mut builder = base_message(ctx, records.request_id, TYPE_FINISH);
    builder
        .add_u8(RecordType::ReplyCode, 0)
        .add(RecordType::SenderKey, &ctx.identity.public)
        .add(RecordType::RecipientKey, peer_key)
        .add(RecordType::SenderHandshakeKey, &local_handshake)
        .add(RecordType::RecipientHandshakeKey, &peer_handshake)
        .add(RecordType::AuthTag, &reply_tag);

    Ok((builder.finish(), secret))
}

/// Handle a Finish as the responder: verify the tag against the state
/// cached at Respond time and hand back the session secret. Leaves the
/// progress state untouched on failure.
pub fn complete(
    ctx: &mut Context,
    records: &HandshakeRecords,
    progress: &HandshakeProgress,
    peer_key: &[u8; KEY_BYTES],
) -> Result<SessionSecret, HandshakeError> {
    let (request_id, cached_local, cached_peer, cached_secret) = match progress {
        HandshakeProgress::Responded {
            request_id,
            local_handshake,
            peer_handshake,
            secret,
        } => (*request_id, local_handshake, peer_handshake, secret),
        HandshakeProgress::Initiated { .. } => return Err(HandshakeError::UnexpectedState),
    };
    if records.request_id != request_id {
        return Err(HandshakeError::UnexpectedState);
    }

    let keys = validate(ctx, records, true)?;
    let peer_handshake = *keys.sender_handshake;
    let own_handshake = *keys.recipient_handshake.expect("validated");
    let tag = keys.tag.expect("validated");

    let Context {
        pool, rng, now, ..
    } = ctx;
    pool.maintain(rng, *now);

    let secret = if own_handshake == *cached_local && peer_handshake == *cached_peer {
        cached_secret.clone()
    } else {
        // the Finish references other keys than the Respond we sent —
        // recompute against the pool
        let handshake_key = ctx
            .pool
            .lookup(&own_handshake, ctx.now)
            .ok_or(HandshakeError::NoHandshakeKey)?;
        derive_shared(false, &ctx.identity, handshake_key, peer_key, &peer_handshake)
            .ok_or(HandshakeError::DegeneratePoint)?
    };

    if !verify_protocol_tag(tag, &secret, peer_key, &own_handshake) {
        return Err(HandshakeError::TagMismatch);
    }

    Ok(secret)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
