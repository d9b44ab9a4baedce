//! Challenge signing with agent-held keys or a single provided key.
//!
//! The signer cannot know which key the verifier trusts, so key choice is a
//! function of a caller-driven ordinal: `skip` selects the key at that
//! position in the agent's list. The caller retries with `skip + 1` after a
//! rejection until a signature is accepted or [`SignOutcome::Exhausted`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use ssh_key::{HashAlg, Signature};
use tracing::{debug, warn};

use crate::agent::{AgentConnection, AgentKey};
use crate::config::IdentityConfig;
use crate::error::{AgentError, SignError};
use crate::key::sign_message;

/// Default bound on one agent round trip.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one signing attempt.
#[derive(Debug, Clone)]
pub enum SignOutcome {
    /// The challenge signed with the selected key.
    Signed(Signature),
    /// `skip` is past the last key: every available key has been tried.
    Exhausted,
}

impl SignOutcome {
    pub fn signature(&self) -> Option<&Signature> {
        match self {
            SignOutcome::Signed(sig) => Some(sig),
            SignOutcome::Exhausted => None,
        }
    }
}

/// Signs challenges using the configured identity source.
#[derive(Debug, Clone)]
pub struct Signer {
    identity: Arc<IdentityConfig>,
    agent_timeout: Duration,
}

impl Signer {
    pub fn new(identity: IdentityConfig) -> Self {
        Self {
            identity: Arc::new(identity),
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &IdentityConfig {
        &self.identity
    }

    /// Sign `challenge` with the key at ordinal `skip`.
    ///
    /// With an agent configured, every call connects to the agent and fetches
    /// its key list afresh. The agent does not promise a stable order across
    /// fetches; use [`Signer::session`] to pin one list for a retry loop.
    pub async fn sign(&self, challenge: &[u8], skip: usize) -> Result<SignOutcome, SignError> {
        debug!(
            "Sign request: challenge={}, skip={}",
            challenge_digest(challenge),
            skip
        );

        let Some(agent_address) = self.identity.agent_address() else {
            return sign_with_provided_key(&self.identity, challenge, skip);
        };

        with_deadline(self.agent_timeout, async {
            let mut conn = AgentConnection::connect(agent_address).await?;
            let keys = conn.list_keys().await?;
            select_and_sign(&mut conn, &keys, challenge, skip).await
        })
        .await
    }

    /// Start one authentication session.
    pub fn session(&self) -> SigningSession {
        SigningSession {
            signer: self.clone(),
            keys: None,
        }
    }
}

/// Signing state for one authentication session.
///
/// The agent's key list is fetched on the first attempt and reused for
/// every later `skip` in this session, so ordinals keep pointing at the
/// same keys even if the agent's list changes mid-loop. A key removed from
/// the agent in the meantime fails with [`SignError::Signing`]. Once the
/// list is pinned, a `skip` past its end is answered without contacting
/// the agent.
#[derive(Debug)]
pub struct SigningSession {
    signer: Signer,
    keys: Option<Vec<AgentKey>>,
}

impl SigningSession {
    pub async fn sign(&mut self, challenge: &[u8], skip: usize) -> Result<SignOutcome, SignError> {
        let identity = self.signer.identity.clone();
        let Some(agent_address) = identity.agent_address() else {
            return sign_with_provided_key(&identity, challenge, skip);
        };

        let cached = &mut self.keys;
        with_deadline(self.signer.agent_timeout, async move {
            if let Some(keys) = cached.as_deref() {
                let Some(key) = select_key(keys, skip)? else {
                    return Ok(SignOutcome::Exhausted);
                };
                let mut conn = AgentConnection::connect(agent_address).await?;
                return sign_with_agent_key(&mut conn, key, challenge, skip, keys.len()).await;
            }

            let mut conn = AgentConnection::connect(agent_address).await?;
            let keys = cached.insert(conn.list_keys().await?);
            select_and_sign(&mut conn, keys, challenge, skip).await
        })
        .await
    }

    /// Keys pinned for this session, once fetched.
    pub fn keys(&self) -> Option<&[AgentKey]> {
        self.keys.as_deref()
    }
}

fn sign_with_provided_key(
    identity: &IdentityConfig,
    challenge: &[u8],
    skip: usize,
) -> Result<SignOutcome, SignError> {
    // A single provided key is never retried.
    if skip > 0 {
        return Err(SignError::NoFallbackKey);
    }

    debug!("Falling back on provided key");
    let key = identity.provided_key().ok_or(SignError::NoKeyAvailable)?;
    sign_message(key, challenge)
        .map(SignOutcome::Signed)
        .map_err(|e| SignError::Signing(e.to_string()))
}

async fn select_and_sign(
    conn: &mut AgentConnection,
    keys: &[AgentKey],
    challenge: &[u8],
    skip: usize,
) -> Result<SignOutcome, SignError> {
    let Some(key) = select_key(keys, skip)? else {
        return Ok(SignOutcome::Exhausted);
    };
    sign_with_agent_key(conn, key, challenge, skip, keys.len()).await
}

/// The key at ordinal `skip`, or `None` once the list is exhausted.
fn select_key(keys: &[AgentKey], skip: usize) -> Result<Option<&AgentKey>, SignError> {
    if keys.is_empty() {
        return Err(SignError::NoKeysInAgent);
    }

    let key = keys.get(skip);
    if key.is_none() {
        debug!("Key list exhausted: skip={}, keys={}", skip, keys.len());
    }
    Ok(key)
}

async fn sign_with_agent_key(
    conn: &mut AgentConnection,
    key: &AgentKey,
    challenge: &[u8],
    skip: usize,
    key_count: usize,
) -> Result<SignOutcome, SignError> {
    debug!(
        "Signing with agent key {} ({}/{})",
        key.public_key().fingerprint(HashAlg::Sha256),
        skip + 1,
        key_count
    );

    match conn.sign(key, challenge).await {
        Ok(sig) => Ok(SignOutcome::Signed(sig)),
        Err(AgentError::Failure) => {
            warn!("Agent refused to sign with key at {}", skip);
            Err(SignError::Signing("agent refused the sign request".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn with_deadline<F>(timeout: Duration, fut: F) -> Result<SignOutcome, SignError>
where
    F: Future<Output = Result<SignOutcome, SignError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| SignError::Timeout(timeout))?
}

/// Short digest identifying a challenge in logs without printing it.
fn challenge_digest(challenge: &[u8]) -> String {
    hex::encode(&Sha256::digest(challenge)[..8])
}
