//! ridge-core — the cryptographic core of the Ridge tunnel daemon.
//!
//! Two peers identified by long-term Curve25519 keys run the
//! EC25519-FHMQVC handshake to agree on a session secret, then exchange
//! datagrams through an authenticated record layer. The core is
//! single-threaded and run-to-completion: the daemon feeds it datagrams,
//! payloads, and clock ticks through the [`peer::PeerTable`], and carries
//! out the [`peer::Output`] actions it returns.

pub mod buffer;
pub mod config;
pub mod context;
pub mod crypto;
pub mod handshake;
pub mod identity;
pub mod method;
pub mod peer;
pub mod session;
pub mod time;
pub mod wire;

pub use buffer::Buffer;
pub use config::Config;
pub use context::Context;
pub use identity::Keypair;
pub use peer::{Output, PeerTable};
pub use time::Timestamp;
