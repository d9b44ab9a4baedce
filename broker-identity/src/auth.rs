//! Challenge/response loop against a verifier that trusts one unknown key.
//!
//! ```text
//! skip = 0
//! loop:
//!     sign(challenge, skip) ── Exhausted ──► AuthOutcome::Exhausted
//!        │ Signed
//!        ▼
//!     submit(skip, sig) ── Accepted ──► AuthOutcome::Accepted { skip }
//!        │ Rejected
//!        ▼
//!     skip += 1
//! ```

use std::future::Future;

use ssh_key::Signature;
use tracing::{debug, info};

use crate::error::AuthError;
use crate::signer::{SignOutcome, SigningSession};

/// Verifier answer to one submitted signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected,
}

/// How an authentication loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The signature made with the key at `skip` was accepted.
    Accepted { skip: usize },
    /// Every key was tried and rejected.
    Exhausted { attempts: usize },
}

/// The verifier side of the exchange, usually backed by a message channel.
pub trait ChallengeVerifier {
    type Error: std::error::Error + 'static;

    /// Submit the signature made with the key at `skip`.
    fn submit(
        &mut self,
        skip: usize,
        signature: &Signature,
    ) -> impl Future<Output = Result<Verdict, Self::Error>>;
}

/// Sign `challenge` with successive keys until `verifier` accepts one.
///
/// In provided-key mode a rejection of the only key ends the loop with
/// [`crate::SignError::NoFallbackKey`].
pub async fn authenticate<V: ChallengeVerifier>(
    session: &mut SigningSession,
    challenge: &[u8],
    verifier: &mut V,
) -> Result<AuthOutcome, AuthError<V::Error>> {
    let mut skip = 0;
    loop {
        let signature = match session.sign(challenge, skip).await? {
            SignOutcome::Signed(signature) => signature,
            SignOutcome::Exhausted => {
                info!("Verifier rejected all {} keys", skip);
                return Ok(AuthOutcome::Exhausted { attempts: skip });
            }
        };

        match verifier
            .submit(skip, &signature)
            .await
            .map_err(AuthError::Verifier)?
        {
            Verdict::Accepted => {
                info!("Verifier accepted key at {}", skip);
                return Ok(AuthOutcome::Accepted { skip });
            }
            Verdict::Rejected => debug!("Verifier rejected key at {}", skip),
        }
        skip += 1;
    }
}
