use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::trace;

use super::{
    error::{Error, Result},
    wire::FrameCodec,
    Transport,
};
use crate::config::ForwardConfig;

/// One TCP connection per request: connect, write the frame, read the reply
/// frame, close.
#[derive(Debug, Clone, Copy)]
pub struct TcpTransport {
    codec: FrameCodec,
}

impl TcpTransport {
    pub fn new(codec: FrameCodec) -> Self {
        Self { codec }
    }

    pub fn from_config(config: &ForwardConfig) -> Self {
        Self::new(FrameCodec::from_config(config))
    }

    async fn exchange(&self, addr: &str, frame: &[u8]) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|source| Error::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        trace!("connected to {}, sending {} bytes", addr, frame.len());
        self.codec.write_frame(&mut stream, frame).await?;
        // the peer was reached, so losing it from here on is not a connect failure
        let reply = self
            .codec
            .read_frame(&mut stream)
            .await
            .map_err(|e| match e {
                Error::Io(source) => Error::NoReply {
                    addr: addr.to_string(),
                    source,
                },
                other => other,
            })?;
        trace!("received {} bytes from {}", reply.len(), addr);
        Ok(reply)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, addr: &str, frame: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        tokio::time::timeout(timeout, self.exchange(addr, &frame))
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }
}
