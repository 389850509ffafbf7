use std::time::Duration;

use async_trait::async_trait;

pub mod endpoint;
pub mod error;
pub mod tcp;
pub mod wire;

use error::Result;

/// Moves one frame to a node and brings its reply frame back.
///
/// Implementations are shared by every branch of every dispatch on a node, so
/// `send` is called concurrently and must not serialise callers. It has to
/// give up once `timeout` has passed, returning `Error::Timeout`. A failure
/// to reach the peer at all is `Error::Connect`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, addr: &str, frame: Vec<u8>, timeout: Duration) -> Result<Vec<u8>>;
}
