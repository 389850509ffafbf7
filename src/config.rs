use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::net::error::{Error, Result};

/// Tunables for a forwarding node. Every node of a tree uses its own copy;
/// the tree shape itself travels on the wire, so nodes may disagree on
/// `fanout` without breaking accounting.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ForwardConfig {
    /// Maximum number of direct children any forwarding node addresses.
    #[builder(default = 16)]
    pub fanout: usize,
    /// Overall budget for a top-level dispatch.
    #[builder(default = Duration::from_secs(10))]
    pub timeout: Duration,
    /// Estimated cost of one hop, subtracted from the budget before it is
    /// handed to the next level.
    #[builder(default = Duration::from_millis(100))]
    pub hop_overhead: Duration,
    #[builder(default = 64 * 1024 * 1024)]
    pub max_frame_len: usize,
    /// Frame bodies larger than this are zstd compressed.
    #[builder(default = 16 * 1024)]
    pub compress_threshold: usize,
}

impl ForwardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fanout == 0 {
            return Err(Error::InvalidFanout);
        }
        // frame lengths travel as u32
        if u32::try_from(self.max_frame_len).is_err() {
            return Err(Error::InvalidConfig("max_frame_len does not fit in 32 bits"));
        }
        Ok(())
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
