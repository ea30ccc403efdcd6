//! Long-term identity keys.
//!
//! One Curve25519 keypair per daemon; the secret scalar is sanitized per
//! RFC 7748 on load and zeroized on drop. Key generation reads the
//! platform's blocking CSPRNG so a freshly installed machine cannot mint
//! a key from an unseeded pool.
//!
//! Key file format: a line `secret` followed by 64 hex digits
//! (case-insensitive on input, lowercase on output).

use std::fmt::Write as _;
use std::path::Path;

use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{self, KEY_BYTES};

pub struct Keypair {
    secret: Zeroizing<[u8; KEY_BYTES]>,
    pub public: [u8; KEY_BYTES],
}

impl Keypair {
    /// Build from raw secret bytes, sanitizing first. The public half is
    /// always derived, never stored.
    pub fn from_secret(mut secret: [u8; KEY_BYTES]) -> Keypair {
        crypto::secret_sanitize(&mut secret);
        let public = crypto::scalar_base_mult(&crypto::scalar_load(&secret)).encode();
        Keypair {
            secret: Zeroizing::new(secret),
            public,
        }
    }

    /// Generate a fresh keypair from the blocking CSPRNG.
    pub fn generate() -> Keypair {
        let mut secret = Zeroizing::new([0u8; KEY_BYTES]);
        crypto::csprng_blocking(&mut *secret);
        Keypair::from_secret(*secret)
    }

    pub fn secret(&self) -> &[u8; KEY_BYTES] {
        &self.secret
    }

    /// The `Secret:`/`Public:` display block printed by key generation.
    pub fn display(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Secret: {}", hex::encode(*self.secret));
        let _ = writeln!(out, "Public: {}", hex::encode(self.public));
        out
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(std::path::PathBuf, std::io::Error),

    #[error("no `secret` line found")]
    MissingSecret,

    #[error("secret is not 64 hex digits")]
    BadSecret,
}

/// Parse key-file text: the first `secret <hex>` line wins.
pub fn parse_secret(text: &str) -> Result<Zeroizing<[u8; KEY_BYTES]>, IdentityError> {
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("secret") {
            continue;
        }
        let hex_digits = parts.next().ok_or(IdentityError::BadSecret)?;
        if parts.next().is_some() {
            return Err(IdentityError::BadSecret);
        }
        let mut secret = Zeroizing::new([0u8; KEY_BYTES]);
        hex::decode_to_slice(hex_digits, &mut *secret).map_err(|_| IdentityError::BadSecret)?;
        return Ok(secret);
    }
    Err(IdentityError::MissingSecret)
}

pub fn load_secret_file(path: &Path) -> Result<Zeroizing<[u8; KEY_BYTES]>, IdentityError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| IdentityError::ReadFailed(path.to_path_buf(), e))?;
    parse_secret(&text)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
