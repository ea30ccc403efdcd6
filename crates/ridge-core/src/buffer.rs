//! Packet buffers with explicit ownership.
//!
//! A [`Buffer`] is consumed by value on every encrypt, decrypt, and dispatch
//! path. A branch that neither forwards nor drops its buffer does not
//! compile, which is the whole point: the record layer and the outer packet
//! dispatch can never leak or double-handle a packet.
//!
//! Buffers carry head space so that a payload handed down from the TUN side
//! can grow a nonce and an outer header in place, without copying the body.

/// An owned packet buffer with reserved head space.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    start: usize,
}

impl Buffer {
    /// Wrap received bytes. No head space; receive paths only shrink.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Buffer { data, start: 0 }
    }

    /// A buffer holding `payload` with `head` bytes of room in front of it.
    pub fn with_head_space(head: usize, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(head + payload.len());
        data.resize(head, 0);
        data.extend_from_slice(payload);
        Buffer { data, start: head }
    }

    /// An empty buffer with `head` bytes of room — keepalives start here.
    pub fn empty_with_head_space(head: usize) -> Self {
        Buffer {
            data: vec![0; head],
            start: head,
        }
    }

    /// Remaining head space in front of the payload.
    pub fn head_space(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.start..]
    }

    /// Prepend `bytes`, consuming head space.
    ///
    /// Running out of head space is a programmer error — callers size
    /// buffers from [`min_encrypt_head_space`](crate::method::Method) — so
    /// this panics rather than failing softly.
    pub fn push_head(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.start,
            "buffer head space exhausted ({} < {})",
            self.start,
            bytes.len()
        );
        self.start -= bytes.len();
        self.data[self.start..self.start + bytes.len()].copy_from_slice(bytes);
    }

    /// Drop the first `n` payload bytes, converting them back to head space.
    pub fn pull_head(&mut self, n: usize) {
        assert!(n <= self.len(), "pull_head past end of buffer");
        self.start += n;
    }

    pub fn push_tail(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Shorten the payload to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.data.truncate(self.start + len);
        }
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.drain(..self.start);
        self.data
    }
}
