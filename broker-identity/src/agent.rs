//! Client for an external SSH key agent.
//!
//! Uses the agent's length-prefixed wire format over its Unix socket:
//! a big-endian u32 length, then a payload whose first byte is the
//! message type. Private key material never crosses this boundary; the
//! agent lists public key blobs and signs on request.

use std::path::Path;

use ssh_key::{Algorithm, PublicKey, Signature};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::AgentError;

pub(crate) const SSH_AGENT_FAILURE: u8 = 5;
pub(crate) const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub(crate) const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub(crate) const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
pub(crate) const SSH_AGENT_SIGN_RESPONSE: u8 = 14;

/// Request an `rsa-sha2-512` signature for RSA keys.
pub(crate) const SSH_AGENT_RSA_SHA2_512: u32 = 4;

const MAX_AGENT_FRAME: usize = 256 * 1024;

/// A key held by the agent, as listed by it.
#[derive(Debug, Clone)]
pub struct AgentKey {
    blob: Vec<u8>,
    public_key: PublicKey,
    comment: String,
}

impl AgentKey {
    /// The public half of the key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    fn sign_flags(&self) -> u32 {
        match self.public_key.algorithm() {
            Algorithm::Rsa { .. } => SSH_AGENT_RSA_SHA2_512,
            _ => 0,
        }
    }
}

/// One open connection to the key agent.
#[derive(Debug)]
pub struct AgentConnection {
    stream: UnixStream,
}

impl AgentConnection {
    /// Connect to the agent listening at `socket_path`.
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let stream = UnixStream::connect(socket_path.as_ref()).await?;
        Ok(Self { stream })
    }

    /// List the keys the agent holds, in the order the agent returns them.
    pub async fn list_keys(&mut self) -> Result<Vec<AgentKey>, AgentError> {
        let response = self.request(&[SSH_AGENTC_REQUEST_IDENTITIES]).await?;
        let mut reader = WireReader::new(&response);
        match reader.u8()? {
            SSH_AGENT_IDENTITIES_ANSWER => {}
            SSH_AGENT_FAILURE => return Err(AgentError::Failure),
            other => {
                return Err(AgentError::Protocol(format!(
                    "Unexpected reply {} to identity request",
                    other
                )))
            }
        }

        let count = reader.u32()? as usize;
        let mut keys = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let blob = reader.string()?.to_vec();
            let comment = String::from_utf8_lossy(reader.string()?).into_owned();
            let public_key = PublicKey::from_bytes(&blob)?;
            keys.push(AgentKey {
                blob,
                public_key,
                comment,
            });
        }

        debug!("Agent holds {} keys", keys.len());
        Ok(keys)
    }

    /// Ask the agent to sign `data` with `key`.
    pub async fn sign(&mut self, key: &AgentKey, data: &[u8]) -> Result<Signature, AgentError> {
        let mut request = vec![SSH_AGENTC_SIGN_REQUEST];
        put_string(&mut request, &key.blob);
        put_string(&mut request, data);
        request.extend_from_slice(&key.sign_flags().to_be_bytes());

        let response = self.request(&request).await?;
        let mut reader = WireReader::new(&response);
        match reader.u8()? {
            SSH_AGENT_SIGN_RESPONSE => {}
            SSH_AGENT_FAILURE => return Err(AgentError::Failure),
            other => {
                return Err(AgentError::Protocol(format!(
                    "Unexpected reply {} to sign request",
                    other
                )))
            }
        }

        let encoded = reader.string()?;
        let mut sig_reader = WireReader::new(encoded);
        let algorithm = std::str::from_utf8(sig_reader.string()?)
            .map_err(|_| AgentError::Protocol("Non-UTF-8 signature algorithm".to_string()))?;
        let algorithm = Algorithm::new(algorithm)?;
        let blob = sig_reader.string()?;

        Ok(Signature::new(algorithm, blob)?)
    }

    async fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>, AgentError> {
        let len_bytes = (payload.len() as u32).to_be_bytes();
        self.stream.write_all(&len_bytes).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;

        read_frame(&mut self.stream).await
    }
}

pub(crate) async fn read_frame(stream: &mut UnixStream) -> Result<Vec<u8>, AgentError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let msg_len = u32::from_be_bytes(len_buf) as usize;

    if msg_len == 0 || msg_len > MAX_AGENT_FRAME {
        return Err(AgentError::Protocol(format!(
            "Invalid agent frame length {}",
            msg_len
        )));
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream.read_exact(&mut msg_buf).await?;
    Ok(msg_buf)
}

pub(crate) fn put_string(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

/// Cursor over SSH wire-encoded data.
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], AgentError> {
        if self.buf.len() < n {
            return Err(AgentError::Protocol("Truncated agent message".to_string()));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, AgentError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, AgentError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn string(&mut self) -> Result<&'a [u8], AgentError> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}
