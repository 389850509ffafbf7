//! The control RPCs a forward tree delivers and the replies nodes send back.
//!
//! Both are closed enums archived with rkyv, so a reply is decoded by
//! validating the archive and matching on the variant instead of looking up a
//! per-type decoder.

use rkyv::{AlignedVec, Archive, Deserialize, Serialize};

use crate::net::error::{Error, Result};

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Request {
    /// Liveness check.
    Ping,
    /// Ask each node for its current resource usage.
    NodeStatus,
    /// Deliver a signal to every task of a job step.
    Signal {
        job_id: u32,
        step_id: u32,
        signal: i32,
    },
    /// Terminate a job step.
    Kill { job_id: u32, step_id: u32 },
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct NodeStatus {
    pub hostname: String,
    pub cpus: u16,
    /// One-minute load average, in thousandths.
    pub load_milli: u32,
    pub free_mem_mb: u64,
    pub uptime_secs: u64,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Reply {
    Pong,
    NodeStatus(NodeStatus),
    Signalled {
        job_id: u32,
        step_id: u32,
        /// Tasks the signal reached.
        tasks: u32,
    },
    Killed {
        job_id: u32,
        step_id: u32,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::NodeStatus => "node_status",
            Request::Signal { .. } => "signal",
            Request::Kill { .. } => "kill",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<_, 256>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| Error::Encode(format!("request: {:?}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rkyv::from_bytes::<Request>(&aligned(bytes))
            .map_err(|_| Error::Decode("request"))
    }
}

impl Reply {
    /// Returns true if this reply is the kind of answer `request` expects.
    pub fn answers(&self, request: &Request) -> bool {
        match (request, self) {
            (Request::Ping, Reply::Pong) => true,
            (Request::NodeStatus, Reply::NodeStatus(_)) => true,
            (
                Request::Signal { job_id, step_id, .. },
                Reply::Signalled {
                    job_id: j,
                    step_id: s,
                    ..
                },
            ) => job_id == j && step_id == s,
            (
                Request::Kill { job_id, step_id },
                Reply::Killed {
                    job_id: j,
                    step_id: s,
                },
            ) => job_id == j && step_id == s,
            _ => false,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<_, 256>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| Error::Encode(format!("reply: {:?}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rkyv::from_bytes::<Reply>(&aligned(bytes)).map_err(|_| Error::Decode("reply"))
    }
}

/// Copies `bytes` into a buffer with the alignment rkyv validation expects.
/// Bodies sliced out of a frame sit at arbitrary offsets.
pub(crate) fn aligned(bytes: &[u8]) -> AlignedVec {
    let mut buf = AlignedVec::with_capacity(bytes.len());
    buf.extend_from_slice(bytes);
    buf
}
