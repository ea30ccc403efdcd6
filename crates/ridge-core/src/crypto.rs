//! Cryptographic primitives for Ridge.
//!
//! Provides three things:
//!   1. the Curve25519 group facade used by the FHMQV handshake —
//!      scalar and point arithmetic via curve25519-dalek
//!   2. SHA-256 and HMAC-SHA-256 (with constant-time verification)
//!   3. the blocking CSPRNG used for long-term key generation
//!
//! Short-lived randomness (handshake keys, refresh splay) comes from the
//! seedable RNG inside the [`Context`](crate::context::Context) instead, so
//! tests run deterministic handshakes.
//!
//! All secret material is wrapped in `Zeroizing` — wiped from memory when
//! dropped. There is no unsafe code in this module.

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::traits::IsIdentity;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub use curve25519_dalek::scalar::Scalar;

type HmacSha256 = Hmac<Sha256>;

/// Curve25519 public values, SHA-256 digests, HMAC tags — all 32 bytes.
pub const KEY_BYTES: usize = 32;

// ── Curve group facade ────────────────────────────────────────────────────────

/// A group element that may be unusable.
///
/// Decoding never fails: an encoding that names no curve point yields an
/// unusable `Point`. Arithmetic involving an unusable point stays unusable,
/// and [`Point::is_identity`] reports unusable points as the identity, so one
/// check after the full key-agreement computation rejects every degenerate
/// input — garbage encodings and small-subgroup probes alike.
#[derive(Clone, Copy)]
pub struct Point(Option<EdwardsPoint>);

impl Point {
    pub fn decode(bytes: &[u8; KEY_BYTES]) -> Point {
        Point(CompressedEdwardsY(*bytes).decompress())
    }

    /// Canonical 32-byte encoding. Unusable points encode as zeroes; callers
    /// must have checked `is_identity` before encoding anything secret-bearing.
    pub fn encode(&self) -> [u8; KEY_BYTES] {
        match self.0 {
            Some(p) => p.compress().to_bytes(),
            None => [0u8; KEY_BYTES],
        }
    }

    pub fn is_identity(&self) -> bool {
        match self.0 {
            Some(p) => p.is_identity(),
            None => true,
        }
    }
}

pub fn scalar_base_mult(scalar: &Scalar) -> Point {
    Point(Some(EdwardsPoint::mul_base(scalar)))
}

pub fn scalar_mult(scalar: &Scalar, point: &Point) -> Point {
    Point(point.0.map(|p| p * scalar))
}

pub fn point_add(p: &Point, q: &Point) -> Point {
    match (p.0, q.0) {
        (Some(p), Some(q)) => Point(Some(p + q)),
        _ => Point(None),
    }
}

/// Load 32 bytes as a scalar, reduced modulo the group order.
pub fn scalar_load(bytes: &[u8; KEY_BYTES]) -> Scalar {
    Scalar::from_bytes_mod_order(*bytes)
}

/// `a·b + c` modulo the group order — the FHMQV combined-scalar step.
pub fn scalar_mul_add(a: &Scalar, b: &Scalar, c: &Scalar) -> Scalar {
    a * b + c
}

/// Clamp a 32-byte secret per RFC 7748. Idempotent.
pub fn secret_sanitize(scalar: &mut [u8; KEY_BYTES]) {
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
}

// ── Hashing ───────────────────────────────────────────────────────────────────

/// SHA-256 over the concatenation of `parts`.
///
/// The handshake hashes runs of public keys (`X ‖ Y ‖ A ‖ B ‖ …`); taking
/// the parts as a slice avoids assembling the concatenation first.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Sha256::new();
    for part in parts {
        h.update(part);
    }
    h.finalize().into()
}

pub fn hmac_sha256(key: &[u8; 32], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Constant-time HMAC-SHA-256 verification.
pub fn hmac_sha256_verify(tag: &[u8; 32], key: &[u8; 32], parts: &[&[u8]]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag).is_ok()
}

// ── Session secret ────────────────────────────────────────────────────────────

/// The 32-byte secret a completed handshake hands to the method layer.
/// Zeroed on drop.
#[derive(Clone)]
pub struct SessionSecret(Zeroizing<[u8; 32]>);

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionSecret").field(&"[redacted]").finish()
    }
}

impl SessionSecret {
    pub fn new(bytes: [u8; 32]) -> Self {
        SessionSecret(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// ── Randomness ────────────────────────────────────────────────────────────────

/// Fill `out` from the platform CSPRNG, blocking until it is seeded.
/// Used only for long-term identity key generation.
pub fn csprng_blocking(out: &mut [u8]) {
    rand::rngs::OsRng.fill_bytes(out);
}

// ── Tests ─────────────────────────────────────────────────────────────────────
