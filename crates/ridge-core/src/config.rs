//! Configuration for the Ridge core.
//!
//! Resolution order: explicit path → $RIDGE_CONFIG → defaults. The file is
//! TOML. Timing options follow the protocol contracts: `key_valid`,
//! `key_refresh`, and `key_refresh_splay` are seconds; `reorder_time` and
//! `keepalive_interval` are milliseconds.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::method::common::REORDER_BITMAP_BITS;

/// Whether the tunnel carries Ethernet frames or IP packets. Both ends
/// must agree; the handshake verifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Tap,
    Tun,
}

impl Mode {
    pub fn wire_byte(self) -> u8 {
        match self {
            Mode::Tap => 0,
            Mode::Tun => 1,
        }
    }
}

/// One configured peer, as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerEntry {
    /// Peer long-term public key, 64 hex digits. A peer without a key is
    /// disabled at load time.
    pub key: String,
    /// Fixed remote address. Peers with neither an address nor `float`
    /// nor a hostname can only be reached once the remote dials us.
    pub address: Option<SocketAddr>,
    /// Floating peers may handshake from any source address.
    pub float: bool,
    /// Dynamic peers get their address from name resolution at handshake
    /// time. Resolution itself is the daemon's job.
    pub hostname: Option<String>,
}

impl Default for PeerEntry {
    fn default() -> Self {
        PeerEntry {
            key: String::new(),
            address: None,
            float: false,
            hostname: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local secret key, 64 hex digits. Alternative: `secret_file`.
    pub secret: Option<String>,
    /// Path to a key file in the `secret <hex>` format.
    pub secret_file: Option<PathBuf>,

    pub mode: Mode,

    /// Selected AEAD construction name.
    pub method: String,
    /// Force a specific provider of the construction (e.g. "portable").
    pub method_provider: Option<String>,

    /// Seconds a session remains decryptable after establishment.
    pub key_valid: u64,
    /// Seconds after which the initiator begins a rekey.
    pub key_refresh: u64,
    /// Maximum random subtraction from `key_refresh`, in seconds, so both
    /// ends of a link never rekey in lockstep.
    pub key_refresh_splay: u64,

    /// Milliseconds since the last accepted packet during which reordered
    /// (older) packets are still accepted.
    pub reorder_time: u64,
    /// How many positions a packet may lag the newest accepted one.
    /// Capped at the reorder bitmap width (64).
    pub reorder_count: u16,

    /// Milliseconds between outbound keepalives on an idle session.
    pub keepalive_interval: u64,

    pub peers: Vec<PeerEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            secret: None,
            secret_file: None,
            mode: Mode::Tun,
            method: "salsa2012+poly1305".to_string(),
            method_provider: None,
            key_valid: 3600,
            key_refresh: 3300,
            key_refresh_splay: 30,
            reorder_time: 10_000,
            reorder_count: 64,
            keepalive_interval: 10_000,
            peers: Vec::new(),
        }
    }
}

impl Config {
    pub fn key_valid(&self) -> Duration {
        Duration::from_secs(self.key_valid)
    }

    pub fn key_refresh(&self) -> Duration {
        Duration::from_secs(self.key_refresh)
    }

    pub fn key_refresh_splay(&self) -> Duration {
        Duration::from_secs(self.key_refresh_splay)
    }

    pub fn reorder_time(&self) -> Duration {
        Duration::from_millis(self.reorder_time)
    }

    pub fn reorder_count(&self) -> u16 {
        self.reorder_count.min(REORDER_BITMAP_BITS)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval)
    }

    /// Load config: env vars → file → defaults. The file comes from the
    /// explicit path if given, else $RIDGE_CONFIG; `RIDGE_*` variables
    /// override individual fields on top of whatever was read.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => std::env::var("RIDGE_CONFIG").ok().map(PathBuf::from),
        };
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
                toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        if config.reorder_count > REORDER_BITMAP_BITS {
            tracing::warn!(
                reorder_count = config.reorder_count,
                cap = REORDER_BITMAP_BITS,
                "reorder_count capped to the bitmap width"
            );
            config.reorder_count = REORDER_BITMAP_BITS;
        }
        Ok(config)
    }

    /// Apply RIDGE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RIDGE_SECRET") {
            self.secret = Some(v);
        }
        if let Ok(v) = std::env::var("RIDGE_SECRET_FILE") {
            self.secret_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("RIDGE_MODE") {
            match v.as_str() {
                "tap" => self.mode = Mode::Tap,
                "tun" => self.mode = Mode::Tun,
                _ => tracing::warn!(value = %v, "ignoring invalid RIDGE_MODE"),
            }
        }
        if let Ok(v) = std::env::var("RIDGE_METHOD") {
            self.method = v;
        }
        if let Ok(v) = std::env::var("RIDGE_METHOD_PROVIDER") {
            self.method_provider = Some(v);
        }
        if let Ok(v) = std::env::var("RIDGE_KEY_VALID") {
            if let Ok(n) = v.parse() {
                self.key_valid = n;
            }
        }
        if let Ok(v) = std::env::var("RIDGE_KEY_REFRESH") {
            if let Ok(n) = v.parse() {
                self.key_refresh = n;
            }
        }
        if let Ok(v) = std::env::var("RIDGE_KEY_REFRESH_SPLAY") {
            if let Ok(n) = v.parse() {
                self.key_refresh_splay = n;
            }
        }
        if let Ok(v) = std::env::var("RIDGE_REORDER_TIME") {
            if let Ok(n) = v.parse() {
                self.reorder_time = n;
            }
        }
        if let Ok(v) = std::env::var("RIDGE_REORDER_COUNT") {
            if let Ok(n) = v.parse() {
                self.reorder_count = n;
            }
        }
        if let Ok(v) = std::env::var("RIDGE_KEEPALIVE_INTERVAL") {
            if let Ok(n) = v.parse() {
                self.keepalive_interval = n;
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),

    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),

    #[error("no secret configured — set `secret` or `secret_file`")]
    MissingSecret,

    #[error("secret is not 64 hex digits")]
    InvalidSecret,

    #[error("peer {0} has the local public key configured as its key")]
    PeerKeyIsOwn(String),

    #[error("unknown method {0:?}")]
    UnknownMethod(String),
}
