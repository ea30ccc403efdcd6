//! Generic stream-cipher + Poly1305 construction.
//!
//! The per-packet Poly1305 key is the first 32 bytes of the cipher's
//! keystream for that nonce; the payload is encrypted from the second
//! 64-byte block onward. Encrypt-then-MAC: the tag authenticates the
//! ciphertext, and the tag is checked before the reorder window advances,
//! so forged packets cannot disturb replay state.
//!
//! Packet body: `[nonce: 6 ‖ ciphertext ‖ tag: 16]`.
//!
//! The construction is generic over the stream cipher; Ridge instantiates
//! it with Salsa20/12.

use std::marker::PhantomData;

use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use salsa20::cipher::{IvSizeUser, KeyIvInit, StreamCipher, StreamCipherSeek};
use salsa20::Salsa12;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::buffer::Buffer;
use crate::context::Context;
use crate::crypto::SessionSecret;
use crate::method::common::{self, CommonSession, NONCE_BYTES};
use crate::method::{Method, MethodError, MethodSession};
use crate::time::Timestamp;

const TAG_BYTES: usize = 16;

pub struct GenericPoly1305<C> {
    _cipher: PhantomData<C>,
}

/// Salsa20/12 keyed with the raw session secret.
pub static SALSA2012_POLY1305: GenericPoly1305<Salsa12> = GenericPoly1305::new();

impl<C> GenericPoly1305<C> {
    pub const fn new() -> Self {
        GenericPoly1305 {
            _cipher: PhantomData,
        }
    }
}

impl<C> Method for GenericPoly1305<C>
where
    C: KeyIvInit + StreamCipher + StreamCipherSeek + Sync + 'static,
{
    fn min_encrypt_head_space(&self) -> usize {
        NONCE_BYTES
    }

    fn session_init(
        &self,
        ctx: &mut Context,
        secret: &SessionSecret,
        initiator: bool,
    ) -> Box<dyn MethodSession> {
        Box::new(Poly1305Session::<C> {
            key: Zeroizing::new(*secret.as_bytes()),
            common: CommonSession::new(ctx, initiator),
            _cipher: PhantomData,
        })
    }
}

struct Poly1305Session<C> {
    key: Zeroizing<[u8; 32]>,
    common: CommonSession,
    _cipher: PhantomData<C>,
}

impl<C> Poly1305Session<C>
where
    C: KeyIvInit + StreamCipher + StreamCipherSeek,
{
    /// Cipher instance for one nonce, positioned at block 0.
    fn cipher(&self, nonce: &[u8; NONCE_BYTES]) -> C {
        let mut iv = vec![0u8; C::iv_size()];
        iv[..NONCE_BYTES].copy_from_slice(nonce);
        C::new_from_slices(&self.key[..], &iv).expect("cipher key and IV sizes are fixed")
    }
}

impl<C> MethodSession for Poly1305Session<C>
where
    C: KeyIvInit + StreamCipher + StreamCipherSeek,
{
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
        let mut cipher = self.cipher(&nonce);

        let mut otk = poly1305::Key::default();
        cipher.apply_keystream(otk.as_mut_slice());
        cipher.seek(64u64);
        cipher.apply_keystream(buf.as_mut_slice());

        let tag = Poly1305::new(&otk).compute_unpadded(buf.as_slice());
        buf.push_tail(tag.as_slice());
        buf.push_head(&nonce);
        Ok(buf)
    }

    fn decrypt(&mut self, now: Timestamp, packet: &[u8]) -> Result<Buffer, MethodError> {
        if packet.len() < NONCE_BYTES + TAG_BYTES {
            return Err(MethodError::TooShort);
        }
        let nonce = common::decode_nonce(packet);
        let age = self.common.check_nonce(now, nonce)?;

        let body = &packet[NONCE_BYTES..];
        let (ciphertext, tag) = body.split_at(body.len() - TAG_BYTES);

        let mut cipher = self.cipher(&common::encode_nonce(nonce));
        let mut otk = poly1305::Key::default();
        cipher.apply_keystream(otk.as_mut_slice());

        let expected = Poly1305::new(&otk).compute_unpadded(ciphertext);
        if !bool::from(expected.as_slice().ct_eq(tag)) {
            return Err(MethodError::TagMismatch);
        }

        cipher.seek(64u64);
        let mut plaintext = ciphertext.to_vec();
        cipher.apply_keystream(&mut plaintext);

        if !self.common.reorder_check(now, nonce, age) {
            return Err(MethodError::Replay);
        }
        Ok(Buffer::from_vec(plaintext))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sessions() -> (Context, Box<dyn MethodSession>, Box<dyn MethodSession>) {
        let mut ctx = Context::for_tests(3);
        let secret = SessionSecret::new([0x5au8; 32]);
        let a = SALSA2012_POLY1305.session_init(&mut ctx, &secret, true);
        let b = SALSA2012_POLY1305.session_init(&mut ctx, &secret, false);
        (ctx, a, b)
    }

    fn payload(data: &[u8]) -> Buffer {
        Buffer::with_head_space(SALSA2012_POLY1305.min_encrypt_head_space(), data)
    }

    #[test]
    fn round_trip_both_directions() {
        let (ctx, mut a, mut b) = sessions();

        let packet = a.encrypt(payload(b"ping")).unwrap();
        assert_eq!(packet.len(), NONCE_BYTES + 4 + TAG_BYTES);
        assert_ne!(&packet.as_slice()[NONCE_BYTES..NONCE_BYTES + 4], b"ping");
        let plain = b.decrypt(ctx.now, packet.as_slice()).unwrap();
        assert_eq!(plain.as_slice(), b"ping");

        let packet = b.encrypt(payload(b"pong")).unwrap();
        let plain = a.decrypt(ctx.now, packet.as_slice()).unwrap();
        assert_eq!(plain.as_slice(), b"pong");
    }

    #[test]
    fn zero_length_keepalive_round_trips() {
        let (ctx, mut a, mut b) = sessions();
        let packet = a
            .encrypt(Buffer::empty_with_head_space(NONCE_BYTES))
            .unwrap();
        assert_eq!(packet.len(), NONCE_BYTES + TAG_BYTES);
        let plain = b.decrypt(ctx.now, packet.as_slice()).unwrap();
        assert!(plain.is_empty());
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let (ctx, mut a, mut b) = sessions();
        let mut packet = a.encrypt(payload(b"important")).unwrap().into_vec();
        packet[NONCE_BYTES] ^= 0x80;
        assert_eq!(
            b.decrypt(ctx.now, &packet).unwrap_err(),
            MethodError::TagMismatch
        );
    }

    #[test]
    fn tampered_tag_rejected() {
        let (ctx, mut a, mut b) = sessions();
        let mut packet = a.encrypt(payload(b"important")).unwrap().into_vec();
        let last = packet.len() - 1;
        packet[last] ^= 1;
        assert_eq!(
            b.decrypt(ctx.now, &packet).unwrap_err(),
            MethodError::TagMismatch
        );
    }

    #[test]
    fn replay_rejected_after_successful_decrypt() {
        let (ctx, mut a, mut b) = sessions();
        let packet = a.encrypt(payload(b"once")).unwrap();
        b.decrypt(ctx.now, packet.as_slice()).unwrap();
        assert_eq!(
            b.decrypt(ctx.now, packet.as_slice()).unwrap_err(),
            MethodError::Replay
        );
    }

    #[test]
    fn wrong_direction_parity_rejected() {
        let (ctx, mut a, _) = sessions();
        let packet = a.encrypt(payload(b"self")).unwrap();
        // the sender's own session expects the peer's parity
        assert_eq!(
            a.decrypt(ctx.now, packet.as_slice()).unwrap_err(),
            MethodError::BadNonce
        );
    }

    #[test]
    fn send_nonces_advance_by_two() {
        let (_, mut a, _) = sessions();
        let p1 = a.encrypt(payload(b"x")).unwrap();
        let p2 = a.encrypt(payload(b"y")).unwrap();
        let n1 = common::decode_nonce(p1.as_slice());
        let n2 = common::decode_nonce(p2.as_slice());
        assert_eq!(n1, 3);
        assert_eq!(n2, 5);
    }
}
