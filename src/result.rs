use std::fmt;

use hashbrown::HashMap;
use tracing::warn;

use crate::{
    net::{
        error::{Error, Result},
        wire::WireEntry,
    },
    rpc::{Reply, Request},
};

/// Per-node outcome code. `Success` is zero on the wire.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success = 0,
    /// The branch holding this node could not be reached.
    ConnectFailure = 1,
    /// No reply arrived within the hop's budget.
    Timeout = 2,
    /// A reply arrived but could not be decoded or did not answer the
    /// request.
    ProtocolError = 3,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code as u16
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(ErrorCode::Success),
            1 => Ok(ErrorCode::ConnectFailure),
            2 => Ok(ErrorCode::Timeout),
            3 => Ok(ErrorCode::ProtocolError),
            _ => Err(Error::Decode("error code")),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Success => "success",
            ErrorCode::ConnectFailure => "connect failure",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ProtocolError => "protocol error",
        };
        f.write_str(s)
    }
}

/// The outcome recorded for one addressed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEntry {
    pub node: String,
    pub error: ErrorCode,
    /// Return code of the RPC itself, as reported by the node. Zero for
    /// synthesized failures.
    pub return_code: i32,
    /// The decoded reply. Always `None` when `error` is not `Success`.
    pub payload: Option<Reply>,
}

impl ResultEntry {
    pub fn success(node: impl Into<String>, return_code: i32, reply: Reply) -> Self {
        Self {
            node: node.into(),
            error: ErrorCode::Success,
            return_code,
            payload: Some(reply),
        }
    }

    pub fn failed(node: impl Into<String>, error: ErrorCode) -> Self {
        Self {
            node: node.into(),
            error,
            return_code: 0,
            payload: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_success()
    }

    /// Turns one entry of a reply bundle into a typed entry. Anything wrong
    /// with the entry only affects this node: it comes back as a
    /// `ProtocolError` entry.
    pub fn decode(wire: WireEntry, request: &Request) -> Self {
        let WireEntry {
            node,
            error,
            return_code,
            body,
        } = wire;
        let code = match ErrorCode::try_from(error) {
            Ok(code) => code,
            Err(_) => {
                warn!("node {} reported unknown error code {}", node, error);
                return Self::failed(node, ErrorCode::ProtocolError);
            }
        };
        if !code.is_success() {
            return Self::failed(node, code);
        }
        match Reply::decode(&body) {
            Ok(reply) if reply.answers(request) => Self::success(node, return_code, reply),
            Ok(reply) => {
                warn!(
                    "node {} answered a {} request with {:?}",
                    node,
                    request.name(),
                    reply
                );
                Self::failed(node, ErrorCode::ProtocolError)
            }
            Err(e) => {
                warn!("could not decode reply from node {}: {}", node, e);
                Self::failed(node, ErrorCode::ProtocolError)
            }
        }
    }

    pub(crate) fn to_wire(&self) -> Result<WireEntry> {
        let body = match &self.payload {
            Some(reply) => reply.encode()?,
            None => Vec::new(),
        };
        Ok(WireEntry {
            node: self.node.clone(),
            error: self.error.into(),
            return_code: self.return_code,
            body,
        })
    }
}

/// Append-only list of per-node outcomes holding at most one entry per node.
///
/// Insertion order carries no meaning. The name index is what keeps a node
/// from being counted twice when a late reply races a failure mark.
#[derive(Debug, Default, Clone)]
pub struct ResultList {
    entries: Vec<ResultEntry>,
    /// Node name to its position in `entries`.
    index: HashMap<String, usize>,
}

impl ResultList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Like `with_capacity`, but reports allocation failure instead of
    /// aborting the process.
    pub(crate) fn try_with_capacity(capacity: usize) -> Result<Self> {
        let mut list = Self::new();
        list.entries
            .try_reserve_exact(capacity)
            .map_err(|_| Error::ResourceExhausted(capacity))?;
        list.index
            .try_reserve(capacity)
            .map_err(|_| Error::ResourceExhausted(capacity))?;
        Ok(list)
    }

    /// Adds `entry` unless its node already has one. Returns whether the
    /// entry was kept.
    pub fn insert(&mut self, entry: ResultEntry) -> bool {
        if self.index.contains_key(entry.node.as_str()) {
            return false;
        }
        self.index.insert(entry.node.clone(), self.entries.len());
        self.entries.push(entry);
        true
    }

    /// Records a synthesized failure for `node`. A node that already has an
    /// entry keeps it, so marking twice never produces two entries.
    pub fn mark_as_failed_forward(&mut self, node: &str, error: ErrorCode) -> bool {
        self.insert(ResultEntry::failed(node, error))
    }

    pub fn contains(&self, node: &str) -> bool {
        self.index.contains_key(node)
    }

    pub fn get(&self, node: &str) -> Option<&ResultEntry> {
        self.index.get(node).map(|&at| &self.entries[at])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResultEntry> {
        self.entries.iter()
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for entry in &self.entries {
            match entry.error {
                ErrorCode::Success => summary.succeeded += 1,
                ErrorCode::ConnectFailure => summary.connect_failures += 1,
                ErrorCode::Timeout => summary.timeouts += 1,
                ErrorCode::ProtocolError => summary.protocol_errors += 1,
            }
        }
        summary
    }
}

impl IntoIterator for ResultList {
    type Item = ResultEntry;
    type IntoIter = std::vec::IntoIter<ResultEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultList {
    type Item = &'a ResultEntry;
    type IntoIter = std::slice::Iter<'a, ResultEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl Extend<ResultEntry> for ResultList {
    fn extend<T: IntoIterator<Item = ResultEntry>>(&mut self, iter: T) {
        for entry in iter {
            self.insert(entry);
        }
    }
}

/// Counts of each outcome in a result list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub succeeded: usize,
    pub connect_failures: usize,
    pub timeouts: usize,
    pub protocol_errors: usize,
}

impl Summary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed()
    }

    pub fn failed(&self) -> usize {
        self.connect_failures + self.timeouts + self.protocol_errors
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }

    pub fn all_failed(&self) -> bool {
        self.succeeded == 0 && self.total() > 0
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ok ({} unreachable, {} timed out, {} bad replies)",
            self.succeeded,
            self.total(),
            self.connect_failures,
            self.timeouts,
            self.protocol_errors
        )
    }
}
