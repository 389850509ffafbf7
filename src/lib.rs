//! Hierarchical fan-out delivery of control RPCs to large node sets.
//!
//! The issuing node contacts at most `fanout` nodes directly; each of them
//! relays to its share of the rest, and so on down the tree. Every addressed
//! node is accounted for exactly once in the returned [`ResultList`], within
//! the dispatch's timeout, whether it answered, could not be reached, or ran
//! out of time.

pub mod config;
pub mod forward;
pub mod net;
pub mod result;
pub mod rpc;

pub use config::ForwardConfig;
pub use forward::{
    AliasTable, DispatchId, ForwardJob, ForwardSpec, ForwardTree, Forwarder, JobPhase, NodeAddr,
    Relay, RequestHandler,
};
pub use net::{
    endpoint::Endpoint,
    error::{Error, Result},
    tcp::TcpTransport,
    Transport,
};
pub use result::{ErrorCode, ResultEntry, ResultList, Summary};
pub use rpc::{NodeStatus, Reply, Request};
