//! Error types for identity configuration, signing and both transports.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::IdentityConfig;

/// Failure to turn supplied key material into a signing key.
///
/// Returned by [`crate::decrypt_private_key`] for a wrong passphrase or
/// corrupt key material, and by [`crate::parse_private_key`].
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Malformed PEM: {0}")]
    Pem(#[from] pem::PemError),

    #[error("PEM block is not encrypted")]
    NotEncrypted,

    #[error("Key is encrypted; a passphrase is required")]
    PassphraseRequired,

    #[error("Malformed DEK-Info header: {0}")]
    MalformedDekInfo(String),

    #[error("Unsupported PEM cipher: {0}")]
    UnsupportedCipher(String),

    #[error("Decryption failed (wrong passphrase or corrupt key)")]
    Decrypt,

    #[error("Unsupported private key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Invalid private key: {0}")]
    Invalid(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("SSH key error: {0}")]
    Ssh(#[from] ssh_key::Error),
}

/// Configuration finished, but the provided key could not be used.
///
/// Carries the key-less configuration so the caller can decide whether to
/// abort startup or continue with the agent (or nothing) alone.
#[derive(Debug, Error)]
#[error("Provided key unusable, configuration has no fallback key: {source}")]
pub struct ConfigDegraded {
    pub(crate) config: IdentityConfig,
    #[source]
    pub(crate) source: KeyError,
}

impl ConfigDegraded {
    /// Accept the degraded configuration and continue without the key.
    pub fn into_keyless(self) -> IdentityConfig {
        self.config
    }

    /// The reason the provided key was dropped.
    pub fn key_error(&self) -> &KeyError {
        &self.source
    }
}

/// Errors from loading a broker configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors talking to the external key agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Agent refused the request")]
    Failure,

    #[error("Agent returned an unusable key or signature: {0}")]
    Key(#[from] ssh_key::Error),
}

/// Signing preconditions unmet or the signature could not be produced.
///
/// Key exhaustion is not an error; see [`crate::SignOutcome::Exhausted`].
#[derive(Debug, Error)]
pub enum SignError {
    #[error("No key available: no agent configured and no provided key")]
    NoKeyAvailable,

    #[error("No further keys: the provided key is only tried once")]
    NoFallbackKey,

    #[error("No keys available in the key agent")]
    NoKeysInAgent,

    #[error("Key agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Key agent did not answer within {0:?}")]
    Timeout(Duration),
}

/// Errors from the framed message channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
}

/// The local listener could not bind its endpoint.
#[derive(Debug, Error)]
#[error("Failed to bind {path:?}: {source}")]
pub struct BindError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Errors establishing the encrypted channel to the remote verifier.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("Failed to load CA bundle: {0}")]
    CertificateLoad(String),

    #[error("Invalid verifier address {0:?}")]
    InvalidAddress(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Failed to connect to {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {address} failed: {source}")]
    Handshake {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connecting to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },
}

/// Failure of the assembled challenge/response loop.
#[derive(Debug, Error)]
pub enum AuthError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Sign(#[from] SignError),

    #[error("Verifier exchange failed: {0}")]
    Verifier(#[source] E),
}
