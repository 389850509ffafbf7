use std::fmt;

use hashbrown::HashSet;
use tokio::{
    sync::{Mutex, Notify},
    time::{timeout_at, Instant},
};
use tracing::{debug, trace, warn};

use super::tree::TreeNode;
use crate::{
    net::error::{Error, Result},
    result::{ErrorCode, ResultList},
};

/// Lifecycle of one forward job: `Created → Dispatching → Waiting →
/// {Complete | TimedOut} → Collected`. A job whose last branch reports
/// before anyone waits is `Complete` right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Created,
    Dispatching,
    Waiting,
    Complete,
    TimedOut,
    Collected,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Ledger {
    list: ResultList,
    pending: usize,
    phase: JobPhase,
}

/// The shared result list every branch of a job feeds into.
///
/// Branches only ever append under the lock, one call per branch, and never
/// look at each other's entries.
pub struct Aggregator {
    /// Every node the job is accountable for, in arena order.
    expected: Vec<String>,
    members: HashSet<String>,
    ledger: Mutex<Ledger>,
    done: Notify,
}

impl Aggregator {
    pub fn new(nodes: &[TreeNode], branches: usize) -> Result<Self> {
        let mut expected = Vec::new();
        expected
            .try_reserve_exact(nodes.len())
            .map_err(|_| Error::ResourceExhausted(nodes.len()))?;
        let mut members = HashSet::new();
        members
            .try_reserve(nodes.len())
            .map_err(|_| Error::ResourceExhausted(nodes.len()))?;
        for n in nodes {
            expected.push(n.node.name.clone());
            members.insert(n.node.name.clone());
        }

        Ok(Self {
            expected,
            members,
            ledger: Mutex::new(Ledger {
                list: ResultList::try_with_capacity(nodes.len())?,
                pending: branches,
                phase: JobPhase::Created,
            }),
            done: Notify::new(),
        })
    }

    pub async fn phase(&self) -> JobPhase {
        self.ledger.lock().await.phase
    }

    pub(crate) async fn start(&self) {
        let mut ledger = self.ledger.lock().await;
        if ledger.phase == JobPhase::Created {
            ledger.phase = JobPhase::Dispatching;
        }
    }

    /// Records the outcome of one branch. Returns false if the job already
    /// stopped accepting entries and these were dropped as stale.
    pub async fn append(&self, entries: ResultList) -> bool {
        let mut ledger = self.ledger.lock().await;
        if matches!(ledger.phase, JobPhase::TimedOut | JobPhase::Collected) {
            trace!("dropping {} stale entries", entries.len());
            return false;
        }

        for entry in entries {
            if !self.members.contains(entry.node.as_str()) {
                warn!("dropping result for {} which is not part of this dispatch", entry.node);
                continue;
            }
            let node = entry.node.clone();
            if !ledger.list.insert(entry) {
                debug!("{} already has a result, keeping the first one", node);
            }
        }

        ledger.pending = ledger.pending.saturating_sub(1);
        trace!("branch reported, {} pending", ledger.pending);
        if ledger.pending == 0 {
            ledger.phase = JobPhase::Complete;
            self.done.notify_one();
        }
        true
    }

    /// Blocks until every branch reported or `deadline` passes, whichever is
    /// first, and returns which of the two happened. On the deadline every
    /// node without an entry is marked `Timeout` and later appends are
    /// dropped.
    pub async fn wait(&self, deadline: Instant) -> JobPhase {
        {
            let mut ledger = self.ledger.lock().await;
            if matches!(ledger.phase, JobPhase::Created | JobPhase::Dispatching) {
                ledger.phase = JobPhase::Waiting;
            }
        }

        loop {
            if self.ledger.lock().await.pending == 0 {
                break;
            }
            // notify_one leaves a permit behind, so a branch finishing
            // between the check and here is not missed
            if timeout_at(deadline, self.done.notified()).await.is_err() {
                break;
            }
        }

        let mut ledger = self.ledger.lock().await;
        if ledger.pending == 0 {
            ledger.phase = JobPhase::Complete;
        } else if ledger.phase != JobPhase::Collected {
            let before = ledger.list.len();
            for name in &self.expected {
                ledger.list.mark_as_failed_forward(name, ErrorCode::Timeout);
            }
            debug!(
                "deadline passed with {} branches pending, {} nodes marked timed out",
                ledger.pending,
                ledger.list.len() - before
            );
            ledger.phase = JobPhase::TimedOut;
        }
        ledger.phase
    }

    /// Hands out the list, one entry per expected node, and closes the job.
    pub async fn collect(&self) -> ResultList {
        let mut ledger = self.ledger.lock().await;
        // a complete job can still be short if a branch under-reported
        for name in &self.expected {
            if ledger.list.mark_as_failed_forward(name, ErrorCode::ProtocolError) {
                warn!("{} was never reported by its branch", name);
            }
        }
        ledger.phase = JobPhase::Collected;
        std::mem::take(&mut ledger.list)
    }
}
