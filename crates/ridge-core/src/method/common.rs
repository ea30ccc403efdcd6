//! Record-layer state shared by every method construction.
//!
//! Each method session embeds a [`CommonSession`]: the send/receive nonce
//! counters, the reorder window, and the session validity clocks. Methods
//! differ only in how bytes are transformed; the nonce discipline lives
//! here, once.
//!
//! Nonces are 48-bit little-endian counters advancing by 2, with the low
//! bit fixed at session birth: the initiator sends odd nonces starting at
//! 3, the responder even nonces starting at 2. The parity split means the
//! two directions of a shared key can never collide on a nonce.

use std::time::Duration;

use rand::Rng;

use crate::config::Config;
use crate::context::Context;
use crate::method::MethodError;
use crate::time::Timestamp;

/// Wire size of a record-layer nonce.
pub const NONCE_BYTES: usize = 6;

/// Largest value a 6-byte nonce can carry.
const NONCE_MAX: u64 = (1 << 48) - 1;

/// Width of the reorder bitmap; `reorder_count` is capped to this at
/// configuration load.
pub const REORDER_BITMAP_BITS: u16 = 64;

pub fn encode_nonce(nonce: u64) -> [u8; NONCE_BYTES] {
    let bytes = nonce.to_le_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]]
}

pub fn decode_nonce(bytes: &[u8]) -> u64 {
    let mut full = [0u8; 8];
    full[..NONCE_BYTES].copy_from_slice(&bytes[..NONCE_BYTES]);
    u64::from_le_bytes(full)
}

/// The verdict of the nonce-window check, carrying the packet's age in
/// nonce positions (negative = newer than the latest accepted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceAge(i64);

pub struct CommonSession {
    initiator: bool,
    send_nonce: u64,
    receive_nonce: u64,
    /// Bit `i` set — the nonce `i + 1` positions below `receive_nonce` has
    /// been accepted.
    receive_reorder_seen: u64,
    receive_last: Timestamp,
    valid_till: Timestamp,
    refresh_after: Timestamp,
    /// Session parameters are frozen at establishment.
    reorder_time: Duration,
    reorder_count: u16,
    /// Set when the send nonce space is used up; the session reports itself
    /// invalid from then on.
    exhausted: bool,
}

impl CommonSession {
    pub fn new(ctx: &mut Context, initiator: bool) -> CommonSession {
        let config: &Config = &ctx.config;
        let splay_ms = config.key_refresh_splay().as_millis() as u64;
        let splay = Duration::from_millis(if splay_ms == 0 {
            0
        } else {
            ctx.rng.gen_range(0..=splay_ms)
        });

        CommonSession {
            initiator,
            send_nonce: if initiator { 3 } else { 2 },
            receive_nonce: if initiator { 0 } else { 1 },
            receive_reorder_seen: 0,
            receive_last: ctx.now,
            valid_till: ctx.now + config.key_valid(),
            refresh_after: ctx.now + config.key_refresh() - splay,
            reorder_time: config.reorder_time(),
            reorder_count: config.reorder_count(),
            exhausted: false,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn is_valid(&self, now: Timestamp) -> bool {
        !self.exhausted && now < self.valid_till
    }

    /// Initiators drive rekeys; the responder side never reports refresh so
    /// the two ends cannot dial each other simultaneously.
    pub fn want_refresh(&self, now: Timestamp) -> bool {
        self.initiator && now >= self.refresh_after
    }

    /// Claim the next send nonce, advancing by 2. When the 48-bit space is
    /// about to wrap the session declares itself exhausted instead.
    pub fn next_send_nonce(&mut self) -> Result<[u8; NONCE_BYTES], MethodError> {
        if self.exhausted {
            return Err(MethodError::Exhausted);
        }
        let nonce = self.send_nonce;
        match self.send_nonce.checked_add(2) {
            Some(next) if next <= NONCE_MAX => self.send_nonce = next,
            _ => self.exhausted = true,
        }
        Ok(encode_nonce(nonce))
    }

    /// Check a received nonce against parity and the reorder window. Runs
    /// before any cryptography; updates nothing.
    ///
    /// Newer-than-latest packets are always in window. Older packets are
    /// accepted only while the window is fresh (the last accepted packet
    /// arrived within `reorder_time`) and the packet lags by at most
    /// `reorder_count` positions.
    pub fn check_nonce(&self, now: Timestamp, nonce: u64) -> Result<NonceAge, MethodError> {
        if nonce & 1 != self.receive_nonce & 1 {
            return Err(MethodError::BadNonce);
        }

        // Little-endian subtraction in units of 2: positive = older than
        // the latest accepted packet.
        let age = (self.receive_nonce as i64 - nonce as i64) / 2;

        if age >= 0 {
            if now.since(self.receive_last) > self.reorder_time {
                return Err(MethodError::BadNonce);
            }
            if age > i64::from(self.reorder_count) {
                return Err(MethodError::BadNonce);
            }
        }

        Ok(NonceAge(age))
    }

    /// Record an authenticated nonce. Runs after the MAC has been verified,
    /// so forged packets can never advance the window.
    ///
    /// Returns false for duplicates, leaving all state untouched.
    pub fn reorder_check(&mut self, now: Timestamp, nonce: u64, age: NonceAge) -> bool {
        let NonceAge(age) = age;

        if age < 0 {
            // Newer than anything seen: slide the window and record the
            // previous latest at its new distance.
            let shift = -age as u64;
            if shift >= 64 {
                self.receive_reorder_seen = 0;
            } else {
                self.receive_reorder_seen <<= shift;
            }
            if shift <= 64 {
                self.receive_reorder_seen |= 1u64 << (shift - 1);
            }
            self.receive_nonce = nonce;
            self.receive_last = now;
            true
        } else if age == 0 || self.receive_reorder_seen & (1u64 << (age - 1)) != 0 {
            false
        } else {
            self.receive_reorder_seen |= 1u64 << (age - 1);
            true
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
