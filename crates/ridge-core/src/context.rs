//! The explicit per-daemon context.
//!
//! Everything process-wide and mutable — clock snapshot, configuration,
//! identity, handshake-key pool, RNG, the bound method — travels as one
//! value handed to every operation. There is no ambient singleton: tests
//! build as many contexts as they like, each with its own deterministic
//! clock and RNG.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{Config, ConfigError};
use crate::handshake::HandshakeKeyPool;
use crate::identity::Keypair;
use crate::method::registry::{MethodInfo, Registry};
use crate::method::Method;
use crate::time::Timestamp;

pub struct Context {
    /// Monotonic clock snapshot; the event loop updates it once per turn.
    pub now: Timestamp,
    pub config: Config,
    pub rng: StdRng,
    pub identity: Keypair,
    pub pool: HandshakeKeyPool,
    pub registry: Registry,
    pub method_info: MethodInfo,
    pub method: &'static dyn Method,
}

impl Context {
    pub fn new(
        config: Config,
        identity: Keypair,
        rng: StdRng,
        now: Timestamp,
    ) -> Result<Context, ConfigError> {
        let mut registry = Registry::with_defaults();
        if let Some(provider) = &config.method_provider {
            if !registry.select_provider(&config.method, provider) {
                tracing::warn!(
                    method = config.method,
                    provider,
                    "configured method provider not found, keeping probe order"
                );
            }
        }
        let (method_info, method) = registry
            .get(&config.method)
            .ok_or_else(|| ConfigError::UnknownMethod(config.method.clone()))?;

        Ok(Context {
            now,
            config,
            rng,
            identity,
            pool: HandshakeKeyPool::new(),
            registry,
            method_info,
            method,
        })
    }

    /// Deterministic context for tests: seeded RNG, identity derived from
    /// the same seed, clock at an arbitrary origin.
    pub fn for_tests(seed: u64) -> Context {
        use rand::RngCore;

        let mut rng = StdRng::seed_from_u64(seed);
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        let identity = Keypair::from_secret(secret);

        Context::new(
            Config::default(),
            identity,
            rng,
            Timestamp::from_millis(1_000_000),
        )
        .expect("default config resolves")
    }

    /// Advance the clock — test harnesses drive time through this.
    pub fn advance(&mut self, by: std::time::Duration) {
        self.now = self.now + by;
    }
}
