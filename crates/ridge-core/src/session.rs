//! Session state — one current and one previous session per peer.
//!
//! A rekey overlaps two sessions: the freshly established one becomes
//! current while the old one lingers as previous, still able to decrypt
//! in-flight traffic. The overlap ends the moment a packet authenticates
//! on the current session, proving the peer has switched over.

use crate::buffer::Buffer;
use crate::method::{MethodError, MethodSession};
use crate::time::Timestamp;

pub struct Session {
    method: Box<dyn MethodSession>,
    /// Set once a packet has authenticated on this session as current —
    /// the signal that handshake retries can stop and the initiator may
    /// leave the previous session behind.
    pub handshakes_cleaned: bool,
    /// Set when a refresh handshake has been scheduled, so the timer does
    /// not dial twice for the same rekey.
    pub refreshing: bool,
}

impl Session {
    pub fn new(method: Box<dyn MethodSession>) -> Session {
        Session {
            method,
            handshakes_cleaned: false,
            refreshing: false,
        }
    }

    pub fn is_valid(&self, now: Timestamp) -> bool {
        self.method.is_valid(now)
    }

    pub fn is_initiator(&self) -> bool {
        self.method.is_initiator()
    }

    pub fn want_refresh(&self, now: Timestamp) -> bool {
        self.method.want_refresh(now)
    }

    pub fn encrypt(&mut self, buf: Buffer) -> Result<Buffer, MethodError> {
        self.method.encrypt(buf)
    }

    pub fn decrypt(&mut self, now: Timestamp, packet: &[u8]) -> Result<Buffer, MethodError> {
        self.method.decrypt(now, packet)
    }
}

/// Which session a packet decrypted on, carrying the plaintext out.
pub enum DecryptOutcome {
    Previous(Buffer),
    Current(Buffer),
    /// Neither session accepted the packet. The most recent method error
    /// rides along for logging.
    Failed(Option<MethodError>),
}

#[derive(Default)]
pub struct SessionPair {
    current: Option<Session>,
    previous: Option<Session>,
}

impl SessionPair {
    pub fn new() -> SessionPair {
        SessionPair::default()
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Session> {
        self.current.as_mut()
    }

    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }

    /// Any session that can still decrypt?
    pub fn is_usable(&self, now: Timestamp) -> bool {
        self.current.as_ref().is_some_and(|s| s.is_valid(now))
    }

    /// Make room for a fresh current session: a still-valid current moves
    /// to the previous slot if that slot is free; otherwise it is freed in
    /// place.
    pub fn rollover(&mut self, now: Timestamp) {
        let keep = self
            .current
            .as_ref()
            .is_some_and(|c| c.is_valid(now) && !self.previous.as_ref().is_some_and(|p| p.is_valid(now)));
        if keep {
            self.previous = self.current.take();
        } else {
            self.current = None;
        }
    }

    pub fn set_current(&mut self, session: Session) {
        self.current = Some(session);
    }

    /// The previous session is done — the peer has proven it moved on.
    pub fn drop_previous(&mut self) {
        self.previous = None;
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.previous = None;
    }

    /// An expired current session takes the previous down with it, keeping
    /// the invariant that a valid previous implies a valid current.
    pub fn expire(&mut self, now: Timestamp) -> bool {
        if self.current.is_some() && !self.is_usable(now) {
            self.clear();
            return true;
        }
        if self
            .previous
            .as_ref()
            .is_some_and(|p| !p.is_valid(now))
        {
            self.previous = None;
        }
        false
    }

    /// Pick the session to send on. The initiator keeps speaking on the
    /// previous session until the responder acknowledges the new one via a
    /// successful decrypt.
    pub fn select_for_send(&mut self, now: Timestamp) -> Option<&mut Session> {
        let use_previous = match (&self.current, &self.previous) {
            (Some(current), Some(previous)) => {
                current.is_initiator() && !current.handshakes_cleaned && previous.is_valid(now)
            }
            _ => false,
        };
        if use_previous {
            self.previous.as_mut()
        } else {
            self.current.as_mut().filter(|s| s.is_valid(now))
        }
    }

    /// Try the previous session first, then the current one.
    pub fn decrypt(&mut self, now: Timestamp, packet: &[u8]) -> DecryptOutcome {
        let mut last_error = None;
        if let Some(previous) = self.previous.as_mut().filter(|s| s.is_valid(now)) {
            match previous.decrypt(now, packet) {
                Ok(plaintext) => return DecryptOutcome::Previous(plaintext),
                Err(e) => last_error = Some(e),
            }
        }
        if let Some(current) = self.current.as_mut().filter(|s| s.is_valid(now)) {
            match current.decrypt(now, packet) {
                Ok(plaintext) => return DecryptOutcome::Current(plaintext),
                Err(e) => last_error = Some(e),
            }
        }
        DecryptOutcome::Failed(last_error)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::crypto::SessionSecret;
    use crate::method::null::NULL;
    use crate::method::Method;

    fn session(ctx: &mut Context, initiator: bool, secret: u8) -> Session {
        let secret = SessionSecret::new([secret; 32]);
        Session::new(NULL.session_init(ctx, &secret, initiator))
    }

    #[test]
    fn rollover_moves_valid_current_to_previous() {
        let mut ctx = Context::for_tests(1);
        let mut pair = SessionPair::new();
        pair.set_current(session(&mut ctx, true, 1));

        pair.rollover(ctx.now);
        assert!(pair.current().is_none());
        assert!(pair.has_previous());

        pair.set_current(session(&mut ctx, true, 2));
        assert!(pair.is_usable(ctx.now));
    }

    #[test]
    fn rollover_frees_current_when_previous_still_valid() {
        let mut ctx = Context::for_tests(2);
        let mut pair = SessionPair::new();
        pair.set_current(session(&mut ctx, true, 1));
        pair.rollover(ctx.now);
        pair.set_current(session(&mut ctx, true, 2));

        // a second rekey while the first previous is alive
        pair.rollover(ctx.now);
        assert!(pair.current().is_none());
        assert!(pair.has_previous());
    }

    #[test]
    fn expired_current_takes_previous_down() {
        let mut ctx = Context::for_tests(3);
        let mut pair = SessionPair::new();
        pair.set_current(session(&mut ctx, true, 1));
        pair.rollover(ctx.now);
        pair.set_current(session(&mut ctx, true, 2));

        let later = ctx.now + ctx.config.key_valid();
        assert!(pair.expire(later));
        assert!(pair.current().is_none());
        assert!(!pair.has_previous());
    }

    #[test]
    fn initiator_prefers_previous_until_confirmed() {
        let mut ctx = Context::for_tests(4);
        let mut pair = SessionPair::new();

        // old session, then a rekey where we initiated
        pair.set_current(session(&mut ctx, false, 1));
        pair.rollover(ctx.now);
        pair.set_current(session(&mut ctx, true, 2));

        // unconfirmed: previous is chosen (it is the responder-side one)
        let chosen = pair.select_for_send(ctx.now).unwrap();
        assert!(!chosen.is_initiator());

        // confirmation flips selection to current
        pair.current_mut().unwrap().handshakes_cleaned = true;
        let chosen = pair.select_for_send(ctx.now).unwrap();
        assert!(chosen.is_initiator());
    }

    #[test]
    fn responder_side_always_sends_on_current() {
        let mut ctx = Context::for_tests(5);
        let mut pair = SessionPair::new();
        pair.set_current(session(&mut ctx, true, 1));
        pair.rollover(ctx.now);
        // the peer initiated this rekey; we responded
        pair.set_current(session(&mut ctx, false, 2));

        let chosen = pair.select_for_send(ctx.now).unwrap();
        assert!(!chosen.is_initiator());
        assert!(!chosen.handshakes_cleaned);
    }
}
