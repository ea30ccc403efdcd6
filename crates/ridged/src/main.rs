//! ridged — Ridge point-to-point tunnel daemon.

mod daemon;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context as _, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;

use ridge_core::config::Config;
use ridge_core::identity::{self, Keypair};
use ridge_core::{Context, PeerTable, Timestamp};

fn print_usage() {
    println!("Usage: ridged [--config <path>] [--bind <addr>]");
    println!("       ridged generate-key");
    println!();
    println!("Commands");
    println!("  generate-key          Generate a long-term keypair and print it");
    println!();
    println!("Options:");
    println!("  --config <path>       Config file (default: $RIDGE_CONFIG)");
    println!("  --bind <addr>         UDP listen address (default: 0.0.0.0:655)");
    println!();
    println!("Examples:");
    println!("  ridged generate-key");
    println!("  ridged --config /etc/ridge/ridge.toml --bind 0.0.0.0:10655");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.first().map(String::as_str) == Some("generate-key") {
        // the blocking CSPRNG is deliberate: a freshly booted machine
        // must not mint an identity from an unseeded pool
        print!("{}", Keypair::generate().display());
        return Ok(());
    }

    let mut config_path: Option<PathBuf> = None;
    let mut bind_addr = "0.0.0.0:655".to_string();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config_path = Some(args.get(i).context("--config requires a value")?.into());
            }
            "--bind" => {
                i += 1;
                bind_addr = args.get(i).context("--bind requires a value")?.clone();
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => {
                print_usage();
                bail!("unknown argument: {}", other);
            }
        }
        i += 1;
    }

    // Initialise tracing — RUST_LOG controls verbosity
    // e.g. RUST_LOG=debug ridged --config ridge.toml
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::load(config_path.as_deref())?;
    let identity = load_identity(&config)?;
    tracing::info!(public = hex::encode(identity.public), "ridged starting");

    let peers = config.peers.clone();
    let ctx = Context::new(
        config,
        identity,
        StdRng::from_entropy(),
        Timestamp::ZERO,
    )?;
    let table = PeerTable::from_entries(&peers, &ctx.identity.public)?;
    if table.is_empty() {
        tracing::warn!("no usable peers configured");
    }

    let socket = tokio::net::UdpSocket::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    tracing::info!(addr = %socket.local_addr()?, "listening");

    daemon::run(ctx, table, socket, Instant::now()).await
}

fn load_identity(config: &Config) -> Result<Keypair> {
    if let Some(secret_hex) = &config.secret {
        let mut secret = [0u8; 32];
        hex::decode_to_slice(secret_hex, &mut secret)
            .map_err(|_| anyhow::anyhow!("configured secret is not 64 hex digits"))?;
        return Ok(Keypair::from_secret(secret));
    }
    if let Some(path) = &config.secret_file {
        let secret = identity::load_secret_file(path)?;
        return Ok(Keypair::from_secret(*secret));
    }
    bail!("no secret configured — set `secret` or `secret_file`, or run `ridged generate-key`");
}
