use std::sync::Arc;

use hashbrown::HashSet;
use tokio::{
    task::JoinSet,
    time::{timeout_at, Instant},
};
use tracing::{debug, debug_span, trace, warn, Instrument, Span};

use super::{
    aggregator::{Aggregator, JobPhase},
    alias::AliasResolver,
    timeout::TimeoutGovernor,
    tree::{Branch, ForwardTree},
    DispatchId,
};
use crate::{
    net::{
        error::Result,
        wire::{FrameCodec, ForwardHeader, PROTOCOL_VERSION},
        Transport,
    },
    result::{ErrorCode, ResultEntry, ResultList},
    rpc::Request,
};

/// Everything the branches of one dispatch share. Read-only once built.
pub(crate) struct DispatchContext {
    pub id: DispatchId,
    pub transport: Arc<dyn Transport>,
    pub codec: FrameCodec,
    pub governor: TimeoutGovernor,
    pub resolver: AliasResolver,
    pub request: Request,
    pub request_bytes: Vec<u8>,
    pub deadline: Instant,
}

impl DispatchContext {
    /// Runs one branch to completion and returns exactly one entry for each
    /// of its nodes.
    async fn deliver(&self, branch: Branch<'_>) -> ResultList {
        let mut list = ResultList::with_capacity(branch.len());
        let head = branch.head();

        let Some(budget) = self.governor.child_budget(self.deadline, Instant::now()) else {
            debug!(
                "no budget left for {}, marking {} nodes timed out",
                head.name,
                branch.len()
            );
            mark_branch(&mut list, branch, ErrorCode::Timeout);
            return list;
        };

        let addr = self.resolver.resolve(head);
        let (aliases, aliases_expire_at) = self.resolver.for_branch(branch.subtree());
        let header = ForwardHeader {
            version: PROTOCOL_VERSION,
            dispatch_id: self.id.0,
            target: head.name.clone(),
            timeout_us: u64::try_from(budget.as_micros()).unwrap_or(u64::MAX),
            subtree: branch.descriptor(),
            aliases,
            aliases_expire_at,
            request: self.request_bytes.clone(),
        };
        let frame = match self.codec.encode_forward(&header) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("could not build frame for {}: {}", head.name, e);
                mark_branch(&mut list, branch, e.error_code());
                return list;
            }
        };

        debug!(
            "sending to {} at {} with {:?} budget, {} nodes below",
            head.name,
            addr,
            budget,
            branch.subtree().len()
        );
        let wait = self.deadline.saturating_duration_since(Instant::now());
        let reply = match timeout_at(self.deadline, self.transport.send(addr, frame, wait)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                debug!("branch {} failed: {}", head.name, e);
                mark_branch(&mut list, branch, e.error_code());
                return list;
            }
            Err(_) => {
                debug!("no reply from {} before the deadline", head.name);
                mark_branch(&mut list, branch, ErrorCode::Timeout);
                return list;
            }
        };

        self.absorb(branch, &reply, &mut list);
        list
    }

    /// Unpacks a branch's reply bundle into `list`. Nodes of the branch the
    /// bundle doesn't account for are marked `ProtocolError`.
    fn absorb(&self, branch: Branch<'_>, reply: &[u8], list: &mut ResultList) {
        let head = &branch.head().name;
        let bundle = match self.codec.decode_reply(reply) {
            Ok(bundle) if bundle.dispatch_id == self.id.0 => bundle,
            Ok(bundle) => {
                warn!(
                    "{} answered for dispatch {} instead of {}",
                    head,
                    DispatchId(bundle.dispatch_id),
                    self.id
                );
                mark_branch(list, branch, ErrorCode::ProtocolError);
                return;
            }
            Err(e) => {
                warn!("undecodable reply from {}: {}", head, e);
                mark_branch(list, branch, ErrorCode::ProtocolError);
                return;
            }
        };

        let members = branch.names().collect::<HashSet<_>>();
        for wire in bundle.entries {
            if !members.contains(wire.node.as_str()) {
                warn!("{} replied for {} which is outside its branch", head, wire.node);
                continue;
            }
            list.insert(ResultEntry::decode(wire, &self.request));
        }

        for name in branch.names() {
            if list.mark_as_failed_forward(name, ErrorCode::ProtocolError) {
                warn!("reply from {} is missing {}", head, name);
            }
        }
        trace!("absorbed {} entries from {}", list.len(), head);
    }
}

fn mark_branch(list: &mut ResultList, branch: Branch<'_>, error: ErrorCode) {
    for name in branch.names() {
        list.mark_as_failed_forward(name, error);
    }
}

async fn run_branch(
    ctx: Arc<DispatchContext>,
    tree: Arc<ForwardTree>,
    start: usize,
    aggregator: Arc<Aggregator>,
) {
    let entries = ctx.deliver(tree.branch(start)).await;
    if !aggregator.append(entries).await {
        debug!("branch finished after the job was collected");
    }
}

/// A running dispatch.
///
/// Each first-level branch runs in its own task. Call `forward_wait` to get
/// the results; dropping the job instead aborts its branches.
pub struct ForwardJob {
    id: DispatchId,
    deadline: Instant,
    aggregator: Arc<Aggregator>,
    tasks: JoinSet<()>,
    span: Span,
}

impl ForwardJob {
    pub(crate) async fn launch(ctx: DispatchContext, tree: ForwardTree) -> Result<Self> {
        let starts = tree.branches().map(|b| b.start()).collect::<Vec<_>>();
        let aggregator = Arc::new(Aggregator::new(tree.nodes(), starts.len())?);
        let span = debug_span!(
            "forward",
            id = %ctx.id,
            request = ctx.request.name(),
            nodes = tree.len(),
            depth = tree.depth()
        );

        let id = ctx.id;
        let deadline = ctx.deadline;
        let ctx = Arc::new(ctx);
        let tree = Arc::new(tree);
        aggregator.start().await;

        let mut tasks = JoinSet::new();
        for start in starts {
            let branch = tree.branch(start);
            let branch_span = debug_span!(
                parent: &span,
                "branch",
                head = %branch.head().name,
                size = branch.len()
            );
            tasks.spawn(
                run_branch(ctx.clone(), tree.clone(), start, aggregator.clone())
                    .instrument(branch_span),
            );
        }
        span.in_scope(|| debug!("dispatched {} branches", tasks.len()));

        Ok(Self {
            id,
            deadline,
            aggregator,
            tasks,
            span,
        })
    }

    pub fn id(&self) -> DispatchId {
        self.id
    }

    /// The absolute time by which every node of the job has an entry.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub async fn phase(&self) -> JobPhase {
        self.aggregator.phase().await
    }

    /// Waits for the dispatch to finish and returns one entry per addressed
    /// node. Nodes still outstanding at the job's deadline come back as
    /// `Timeout`.
    pub async fn forward_wait(self) -> ResultList {
        let deadline = self.deadline;
        self.forward_wait_until(deadline).await
    }

    /// Like `forward_wait`, but gives up at `deadline` if that comes before
    /// the job's own deadline.
    pub async fn forward_wait_until(mut self, deadline: Instant) -> ResultList {
        let span = self.span.clone();
        async move {
            let deadline = deadline.min(self.deadline);
            let phase = self.aggregator.wait(deadline).await;
            match phase {
                JobPhase::Complete => {
                    while let Some(joined) = self.tasks.join_next().await {
                        if let Err(e) = joined {
                            warn!("branch task failed: {}", e);
                        }
                    }
                }
                _ => {
                    // in-flight branches finish on their own; whatever they
                    // report is dropped because the job timed out
                    debug!("detaching {} in-flight branches", self.tasks.len());
                    self.tasks.detach_all();
                }
            }
            let list = self.aggregator.collect().await;
            debug!("dispatch {}: {}", phase, list.summary());
            list
        }
        .instrument(span)
        .await
    }
}
