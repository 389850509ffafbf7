//! The forward tree.
//!
//! A dispatch to N nodes never opens N connections from one host. The
//! target list is split into at most `fanout` branches; the head of each
//! branch receives the request together with the rest of its branch and
//! repeats the same split below itself, so a request reaches every node in
//! about log_fanout(N) hops. Results travel back up the same way, each hop
//! bundling its own result with everything its children reported.
//!
//! Whatever happens below a branch, every addressed node ends up with exactly
//! one entry in the final list: unreachable branches are marked
//! `ConnectFailure`, branches that run out of time `Timeout`, and garbled
//! replies `ProtocolError`.

use std::{fmt, sync::Arc, time::Duration};

use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

pub mod aggregator;
pub mod alias;
pub mod dispatch;
pub mod relay;
pub mod timeout;
pub mod tree;


pub use aggregator::JobPhase;
pub use alias::{AliasResolver, AliasTable};
pub use dispatch::ForwardJob;
pub use relay::{Relay, RequestHandler};
pub use timeout::TimeoutGovernor;
pub use tree::{Branch, ForwardTree, NodeAddr, TreeNode};

use crate::{
    config::ForwardConfig,
    net::{error::Result, wire::FrameCodec, Transport},
    rpc::Request,
};
use dispatch::DispatchContext;
use timeout::deadline_after;

/// Identifies one dispatch across every hop of its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchId(pub u64);

impl DispatchId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Immutable description of one dispatch: who to reach, in which shape,
/// with how much time and which address overrides.
#[derive(Debug, Clone)]
pub struct ForwardSpec {
    id: DispatchId,
    tree: ForwardTree,
    budget: Duration,
    aliases: Option<AliasTable>,
    request: Request,
}

impl ForwardSpec {
    pub fn new(
        targets: Vec<NodeAddr>,
        fanout: usize,
        budget: Duration,
        request: Request,
    ) -> Result<Self> {
        Ok(Self {
            id: DispatchId::random(),
            tree: ForwardTree::build(targets, fanout)?,
            budget,
            aliases: None,
            request,
        })
    }

    /// The spec of a subtree handed to us by a parent hop.
    pub(crate) fn delegated(
        id: DispatchId,
        tree: ForwardTree,
        budget: Duration,
        aliases: Option<AliasTable>,
        request: Request,
    ) -> Self {
        Self {
            id,
            tree,
            budget,
            aliases,
            request,
        }
    }

    pub fn with_aliases(mut self, aliases: Option<AliasTable>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn id(&self) -> DispatchId {
        self.id
    }

    pub fn tree(&self) -> &ForwardTree {
        &self.tree
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn request(&self) -> &Request {
        &self.request
    }
}

/// Entry point for sending a request through a forward tree. One per
/// process; shared by the request-issuing code and by the relay that answers
/// forwarded requests.
pub struct Forwarder {
    config: ForwardConfig,
    transport: Arc<dyn Transport>,
    codec: FrameCodec,
    governor: TimeoutGovernor,
    /// Overrides for the next top-level dispatch only.
    aliases: Mutex<Option<AliasTable>>,
}

impl Forwarder {
    pub fn new(config: ForwardConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            codec: FrameCodec::from_config(&config),
            governor: TimeoutGovernor::new(config.hop_overhead),
            config,
            transport,
            aliases: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ForwardConfig {
        &self.config
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// Installs address overrides for the next `dispatch`. The table replaces
    /// any previously installed one and is consumed by that dispatch.
    pub async fn set_alias_addresses(&self, table: AliasTable) {
        debug!("installing {} alias addresses", table.len());
        *self.aliases.lock().await = Some(table);
    }

    /// Starts a top-level dispatch of `request` to `targets` with the
    /// configured fan-out and timeout.
    pub async fn dispatch(&self, targets: Vec<NodeAddr>, request: Request) -> Result<ForwardJob> {
        let spec = ForwardSpec::new(targets, self.config.fanout, self.config.timeout, request)?;
        let aliases = self.aliases.lock().await.take();
        self.dispatch_spec(spec.with_aliases(aliases)).await
    }

    /// Starts the dispatch `spec` describes. Its deadline is `spec.budget()`
    /// from now.
    pub async fn dispatch_spec(&self, spec: ForwardSpec) -> Result<ForwardJob> {
        let ForwardSpec {
            id,
            tree,
            budget,
            aliases,
            request,
        } = spec;
        let ctx = DispatchContext {
            id,
            transport: self.transport.clone(),
            codec: self.codec,
            governor: self.governor,
            resolver: AliasResolver::new(aliases),
            request_bytes: request.encode()?,
            request,
            deadline: deadline_after(Instant::now(), budget),
        };
        ForwardJob::launch(ctx, tree).await
    }
}
