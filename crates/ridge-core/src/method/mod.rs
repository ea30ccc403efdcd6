//! Method layer — the authenticated-encryption constructions behind the
//! record layer.
//!
//! A method is a named construction (null, Salsa20/12+Poly1305, …) that
//! turns payload buffers into data packets and back. Every construction
//! embeds the [`CommonSession`](common::CommonSession) record-layer state,
//! so nonce discipline and replay protection behave identically across
//! methods.
//!
//! The registry binds each method name to the first available
//! implementation at startup; sessions hold their construction as a trait
//! object and release key material on drop.

pub mod common;
pub mod generic_poly1305;
pub mod null;
pub mod registry;

use thiserror::Error;

use crate::buffer::Buffer;
use crate::context::Context;
use crate::crypto::SessionSecret;
use crate::time::Timestamp;

/// A registered authenticated-encryption construction.
pub trait Method: Sync {
    /// Head space a payload buffer must carry so that `encrypt` can grow
    /// the packet in place (nonce; the outer packet header is the peer
    /// layer's own three bytes).
    fn min_encrypt_head_space(&self) -> usize;

    /// Create the per-session state for a freshly agreed secret.
    fn session_init(
        &self,
        ctx: &mut Context,
        secret: &SessionSecret,
        initiator: bool,
    ) -> Box<dyn MethodSession>;
}

/// Live session state owned by exactly one session slot. Dropping the
/// state zeroes its key material.
pub trait MethodSession {
    fn is_valid(&self, now: Timestamp) -> bool;

    fn is_initiator(&self) -> bool;

    fn want_refresh(&self, now: Timestamp) -> bool;

    /// Consume a plaintext buffer, produce the data-packet body
    /// `[nonce ‖ method-specific bytes]`. The buffer is gone either way;
    /// on failure it has been dropped.
    fn encrypt(&mut self, buf: Buffer) -> Result<Buffer, MethodError>;

    /// Authenticate and decrypt a data-packet body. Borrows the
    /// ciphertext: the caller owns the inbound buffer and may offer it to
    /// the previous and current session in turn.
    fn decrypt(&mut self, now: Timestamp, packet: &[u8]) -> Result<Buffer, MethodError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MethodError {
    /// The 48-bit send-nonce space is used up; the session must be retired.
    #[error("session nonce space exhausted")]
    Exhausted,

    #[error("packet too short for this method")]
    TooShort,

    /// Wrong parity or outside the reorder window. Checked before any
    /// cryptography.
    #[error("nonce outside the acceptance window")]
    BadNonce,

    /// Authenticated, but the nonce was already accepted once.
    #[error("duplicate nonce")]
    Replay,

    #[error("message authentication failed")]
    TagMismatch,
}
