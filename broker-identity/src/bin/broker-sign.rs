//! Challenge signing tool.
//!
//! Signs a hex challenge with the broker identity and prints
//! `<skip> <algorithm> <hex signature>` for each signature produced.

use broker_identity::{BrokerConfig, SignError, SignOutcome, Signer};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Sign a verifier challenge with agent-held or provided keys.
#[derive(Parser, Debug)]
#[command(name = "broker-sign")]
#[command(about = "Sign a credential broker challenge")]
#[command(version)]
struct Args {
    /// SSH agent socket (or use SSH_AUTH_SOCK env var)
    #[arg(long, env = "SSH_AUTH_SOCK")]
    agent_socket: Option<PathBuf>,

    /// PEM private key used when no agent is configured
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Key passphrase (or use BROKER_KEY_PASSPHRASE env var)
    #[arg(long, env = "BROKER_KEY_PASSPHRASE", default_value = "", hide_env_values = true)]
    passphrase: String,

    /// Broker configuration file (JSON); flags override its key settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ordinal of the key to sign with
    #[arg(long, default_value_t = 0)]
    skip: usize,

    /// Sign with every key from `skip` onwards
    #[arg(long)]
    all: bool,

    /// Challenge bytes, hex encoded
    challenge: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match BrokerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        },
        None => BrokerConfig::default(),
    };
    if args.agent_socket.is_some() {
        config.agent_socket = args.agent_socket.clone();
    }
    if args.key_file.is_some() {
        config.key_file = args.key_file.clone();
    }

    let challenge = match hex::decode(args.challenge.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Challenge is not valid hex: {}", e);
            std::process::exit(1);
        }
    };

    let identity = match config.identity(&args.passphrase) {
        Ok(identity) => identity,
        Err(degraded) => {
            warn!("Continuing without provided key: {}", degraded.key_error());
            degraded.into_keyless()
        }
    };
    info!("Identity: {:?}", identity);

    let signer = Signer::new(identity).with_agent_timeout(config.agent_timeout());
    let mut session = signer.session();

    let mut skip = args.skip;
    loop {
        match session.sign(&challenge, skip).await {
            Ok(SignOutcome::Signed(sig)) => {
                println!("{} {} {}", skip, sig.algorithm(), hex::encode(sig.as_bytes()));
            }
            Ok(SignOutcome::Exhausted) => {
                if skip == args.skip {
                    error!("No key at ordinal {}", skip);
                    std::process::exit(1);
                }
                break;
            }
            // A provided key has exactly one ordinal.
            Err(SignError::NoFallbackKey) if skip > args.skip => break,
            Err(e) => {
                error!("Signing failed: {}", e);
                std::process::exit(1);
            }
        }

        if !args.all {
            break;
        }
        skip += 1;
    }
}
