//! Client-side identity proof for a credential broker.
//!
//! A verifier sends a challenge; this crate signs it with a key held by an
//! SSH agent (or a single provided key) and carries the exchange over a
//! local Unix socket or a TLS connection to the remote verifier.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  Unix socket  ┌──────────────┐     TLS     ┌──────────────┐
//! │ Local client │ ◄───────────► │    Broker    │ ◄─────────► │   Verifier   │
//! │              │ LocalListener │ (this crate) │ RemoteDialer│              │
//! └──────────────┘               └──────┬───────┘             └──────────────┘
//!                                       │ agent protocol
//!                                ┌──────▼───────┐
//!                                │  SSH agent   │
//!                                └──────────────┘
//! ```
//!
//! ## Key selection
//!
//! The verifier trusts one key the broker cannot name in advance, so
//! [`Signer::sign`] takes an ordinal `skip` and the caller retries with
//! `skip + 1` after each rejection. [`authenticate`] drives that loop.
//!
//! ## Usage
//!
//! Sign a challenge from the command line:
//! ```bash
//! broker-sign --agent-socket "$SSH_AUTH_SOCK" --all 6e6f6e6365
//! ```

pub mod agent;
pub mod auth;
pub mod channel;
pub mod config;
pub mod error;
pub mod key;
pub mod local;
pub mod remote;
pub mod signer;

pub use agent::{AgentConnection, AgentKey};
pub use auth::{authenticate, AuthOutcome, ChallengeVerifier, Verdict};
pub use channel::MessageChannel;
pub use config::{BrokerConfig, DialerConfig, IdentityConfig, ListenerConfig};
pub use error::{
    AgentError, AuthError, BindError, ChannelError, ConfigDegraded, ConfigError, DialError,
    KeyError, SignError,
};
pub use key::{decrypt_private_key, parse_private_key};
pub use local::{ListenerHandle, LocalChannel, LocalListener};
pub use remote::{PeerVerification, RemoteChannel, RemoteDialer};
pub use signer::{SignOutcome, Signer, SigningSession};
