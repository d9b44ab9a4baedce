//! Length-prefixed structured messages over a byte stream.
//!
//! Frame layout: little-endian u32 body length, then a bincode body.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ChannelError;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Bidirectional message channel over an established connection.
///
/// Owned by whoever accepted or dialed the connection; dropping it closes
/// the underlying stream.
#[derive(Debug)]
pub struct MessageChannel<S> {
    stream: S,
}

impl<S> MessageChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Serialize and send one message.
    pub async fn send<M: Serialize>(&mut self, message: &M) -> Result<(), ChannelError> {
        let body = bincode::serialize(message)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge(body.len()));
        }

        let len_bytes = (body.len() as u32).to_le_bytes();
        self.stream.write_all(&len_bytes).await?;
        self.stream.write_all(&body).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive and deserialize one message.
    pub async fn recv<M: DeserializeOwned>(&mut self) -> Result<M, ChannelError> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let msg_len = u32::from_le_bytes(len_buf) as usize;

        if msg_len > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge(msg_len));
        }

        let mut msg_buf = vec![0u8; msg_len];
        self.stream.read_exact(&mut msg_buf).await?;
        Ok(bincode::deserialize(&msg_buf)?)
    }

    /// Flush and shut down the write half.
    pub async fn close(mut self) -> Result<(), ChannelError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
