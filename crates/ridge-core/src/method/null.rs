//! The null method — nonce discipline without cryptography.
//!
//! Packets are `[nonce ‖ plaintext]`. Useful for debugging a link and for
//! exercising the record layer in tests; offers no confidentiality or
//! authenticity whatsoever.

use crate::buffer::Buffer;
use crate::context::Context;
use crate::crypto::SessionSecret;
use crate::method::common::{self, CommonSession, NONCE_BYTES};
use crate::method::{Method, MethodError, MethodSession};
use crate::time::Timestamp;

pub struct Null;

pub static NULL: Null = Null;

impl Method for Null {
    fn min_encrypt_head_space(&self) -> usize {
        NONCE_BYTES
    }

    fn session_init(
        &self,
        ctx: &mut Context,
        _secret: &SessionSecret,
        initiator: bool,
    ) -> Box<dyn MethodSession> {
        Box::new(NullSession {
            common: CommonSession::new(ctx, initiator),
        })
    }
}

struct NullSession {
    common: CommonSession,
}

impl MethodSession for NullSession {
    fn is_valid(&self, now: Timestamp) -> bool {
        self.common.is_valid(now)
    }

    fn is_initiator(&self) -> bool {
        self.common.is_initiator()
    }

    fn want_refresh(&self, now: Timestamp) -> bool {
        self.common.want_refresh(now)
    }

    fn encrypt(&mut self, mut buf: Buffer) -> Result<Buffer, MethodError> {
        let nonce = self.common.next_send_nonce()?;
        buf.push_head(&nonce);
        Ok(buf)
    }

    fn decrypt(&mut self, now: Timestamp, packet: &[u8]) -> Result<Buffer, MethodError> {
        if packet.len() < NONCE_BYTES {
            return Err(MethodError::TooShort);
        }
        let nonce = common::decode_nonce(packet);
        let age = self.common.check_nonce(now, nonce)?;

        let plaintext = Buffer::from_vec(packet[NONCE_BYTES..].to_vec());

        if !self.common.reorder_check(now, nonce, age) {
            return Err(MethodError::Replay);
        }
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionSecret;

    fn sessions() -> (Context, Box<dyn MethodSession>, Box<dyn MethodSession>) {
        let mut ctx = Context::for_tests(1);
        let secret = SessionSecret::new([0u8; 32]);
        let a = NULL.session_init(&mut ctx, &secret, true);
        let b = NULL.session_init(&mut ctx, &secret, false);
        (ctx, a, b)
    }

    #[test]
    fn round_trip() {
        let (ctx, mut a, mut b) = sessions();
        let buf = Buffer::with_head_space(NONCE_BYTES, b"hello");
        let packet = a.encrypt(buf).unwrap();
        assert_eq!(packet.len(), NONCE_BYTES + 5);
        let plain = b.decrypt(ctx.now, packet.as_slice()).unwrap();
        assert_eq!(plain.as_slice(), b"hello");
    }

    #[test]
    fn replayed_packet_rejected() {
        let (ctx, mut a, mut b) = sessions();
        let packet = a
            .encrypt(Buffer::with_head_space(NONCE_BYTES, b"once"))
            .unwrap();
        b.decrypt(ctx.now, packet.as_slice()).unwrap();
        assert_eq!(
            b.decrypt(ctx.now, packet.as_slice()).unwrap_err(),
            MethodError::Replay
        );
    }

    #[test]
    fn truncated_packet_rejected() {
        let (ctx, _, mut b) = sessions();
        assert_eq!(
            b.decrypt(ctx.now, &[0u8; 3]).unwrap_err(),
            MethodError::TooShort
        );
    }
}
