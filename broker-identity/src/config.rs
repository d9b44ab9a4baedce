//! Identity and broker configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ssh_key::{HashAlg, PrivateKey};
use tracing::{debug, error, info};

use crate::error::{ConfigDegraded, ConfigError, KeyError};
use crate::key::{decrypt_private_key, parse_private_key};
use crate::remote::PeerVerification;

/// Where signing keys come from.
///
/// Built once at startup and never mutated; [`crate::Signer`] shares it
/// behind an `Arc`.
#[derive(Clone, Default)]
pub struct IdentityConfig {
    agent_address: Option<PathBuf>,
    provided_key: Option<PrivateKey>,
}

impl IdentityConfig {
    /// No agent and no provided key.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Use the key agent listening at `agent_address`.
    pub fn with_agent(agent_address: impl Into<PathBuf>) -> Self {
        Self {
            agent_address: Some(agent_address.into()),
            provided_key: None,
        }
    }

    /// Use a single directly supplied key.
    pub fn with_provided_key(key: PrivateKey) -> Self {
        Self {
            agent_address: None,
            provided_key: Some(key),
        }
    }

    /// Agent only; an empty address means no agent.
    fn keyless(agent_address: Option<&Path>) -> Self {
        Self {
            agent_address: agent_address
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf),
            provided_key: None,
        }
    }

    /// Build the identity from startup input.
    ///
    /// An empty `agent_address` means no agent. Absent key material leaves
    /// the provided-key slot unset. An empty passphrase parses the key as
    /// unencrypted, otherwise it is decrypted first. When the key cannot be
    /// used the error carries the key-less configuration.
    pub fn configure(
        agent_address: Option<&Path>,
        key_material: Option<&[u8]>,
        passphrase: &str,
    ) -> Result<Self, ConfigDegraded> {
        let mut config = Self::keyless(agent_address);

        let Some(key_material) = key_material else {
            return Ok(config);
        };

        let parsed = if passphrase.is_empty() {
            parse_private_key(key_material)
        } else {
            decrypt_private_key(key_material, passphrase)
        };

        match parsed {
            Ok(key) => {
                debug!(
                    "Parsed provided {} key {}",
                    key.algorithm(),
                    key.fingerprint(HashAlg::Sha256)
                );
                config.provided_key = Some(key);
                Ok(config)
            }
            Err(source) => {
                error!("Could not use the provided key: {}", source);
                Err(ConfigDegraded { config, source })
            }
        }
    }

    pub fn agent_address(&self) -> Option<&Path> {
        self.agent_address.as_deref()
    }

    pub fn provided_key(&self) -> Option<&PrivateKey> {
        self.provided_key.as_ref()
    }
}

impl fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("agent_address", &self.agent_address)
            .field(
                "provided_key",
                &self
                    .provided_key
                    .as_ref()
                    .map(|k| k.fingerprint(HashAlg::Sha256).to_string()),
            )
            .finish()
    }
}

fn default_listen_socket() -> PathBuf {
    PathBuf::from("/var/run/credential-broker.sock")
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_sessions() -> usize {
    64
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

/// On-disk broker configuration (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Key agent socket; unset means use `key_file` alone.
    #[serde(default)]
    pub agent_socket: Option<PathBuf>,
    /// PEM private key used when no agent is configured.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Local socket the broker accepts delegated sessions on.
    #[serde(default = "default_listen_socket")]
    pub listen_socket: PathBuf,
    /// `host:port` of the remote verifier.
    #[serde(default)]
    pub verifier_address: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub agent_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Upper bound on concurrently served local sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Verify the verifier's certificate against the CA bundle. Off by
    /// default: the channel only provides confidentiality.
    #[serde(default)]
    pub verify_peer: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            agent_socket: None,
            key_file: None,
            listen_socket: default_listen_socket(),
            verifier_address: None,
            agent_timeout_ms: default_timeout_ms(),
            dial_timeout_ms: default_timeout_ms(),
            max_sessions: default_max_sessions(),
            drain_timeout_ms: default_drain_timeout_ms(),
            verify_peer: false,
        }
    }
}

impl BrokerConfig {
    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_slice(&contents)?;
        info!("Loaded broker configuration from {:?}", path);
        Ok(config)
    }

    /// Build the identity this configuration describes.
    ///
    /// An unreadable key file degrades the same way an unparsable key does.
    pub fn identity(&self, passphrase: &str) -> Result<IdentityConfig, ConfigDegraded> {
        let key_material = match &self.key_file {
            Some(path) => match std::fs::read(path) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    error!("Could not read key file {:?}: {}", path, e);
                    return Err(ConfigDegraded {
                        config: IdentityConfig::keyless(self.agent_socket.as_deref()),
                        source: KeyError::Invalid(format!("unreadable key file: {}", e)),
                    });
                }
            },
            None => None,
        };

        IdentityConfig::configure(
            self.agent_socket.as_deref(),
            key_material.as_deref(),
            passphrase,
        )
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            max_sessions: self.max_sessions.max(1),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }

    pub fn dialer_config(&self) -> DialerConfig {
        DialerConfig {
            connect_timeout: Duration::from_millis(self.dial_timeout_ms),
            verification: if self.verify_peer {
                PeerVerification::VerifyAgainstBundle
            } else {
                PeerVerification::ConfidentialityOnly
            },
            ..DialerConfig::default()
        }
    }
}

/// Local listener limits.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Sessions served at once; further connections wait in the backlog.
    pub max_sessions: usize,
    /// How long `close` waits for in-flight sessions before aborting them.
    pub drain_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            drain_timeout: Duration::from_millis(default_drain_timeout_ms()),
        }
    }
}

/// Remote dialer settings.
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// Bound on TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
    pub verification: PeerVerification,
    /// PEM CA bundle; the embedded bundle when unset.
    pub ca_bundle: Option<Vec<u8>>,
}

impl DialerConfig {
    pub fn with_ca_bundle(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_bundle = Some(pem.into());
        self
    }
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(default_timeout_ms()),
            verification: PeerVerification::default(),
            ca_bundle: None,
        }
    }
}
