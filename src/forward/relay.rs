use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    alias::AliasTable, timeout::deadline_after, tree::ForwardTree, DispatchId, ForwardSpec,
    Forwarder,
};
use crate::{
    net::{
        error::Result,
        wire::{ForwardHeader, FrameCodec, ReplyBundle, WireEntry, WireNode, PROTOCOL_VERSION},
    },
    result::{ErrorCode, ResultEntry, ResultList},
    rpc::{Reply, Request},
};

/// Executes a request on the local node.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Returns the reply and the RPC's own return code.
    async fn handle(&self, request: &Request) -> (Reply, i32);
}

/// The receiving side of a forward tree.
///
/// A hop answers for itself and, if the frame carried a subtree, dispatches
/// the same request to that subtree with the budget it was given. Its reply
/// is sent only after its own dispatch has been waited on, so nothing it
/// started is left unaccounted for.
pub struct Relay {
    forwarder: Arc<Forwarder>,
    handler: Arc<dyn RequestHandler>,
}

impl Relay {
    pub fn new(forwarder: Arc<Forwarder>, handler: Arc<dyn RequestHandler>) -> Self {
        Self { forwarder, handler }
    }

    pub fn codec(&self) -> FrameCodec {
        self.forwarder.codec()
    }

    /// Answers one forward frame with one reply frame.
    pub async fn handle_frame(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let codec = self.codec();
        let header = codec.decode_forward(frame)?;
        let span = debug_span!(
            "relay",
            id = %DispatchId(header.dispatch_id),
            target = %header.target,
            subtree = header.subtree.len()
        );
        async move {
            let bundle = self.answer(header).await?;
            codec.encode_reply(&bundle)
        }
        .instrument(span)
        .await
    }

    pub async fn answer(&self, header: ForwardHeader) -> Result<ReplyBundle> {
        let ForwardHeader {
            dispatch_id,
            target,
            timeout_us,
            subtree,
            aliases,
            aliases_expire_at,
            request,
            ..
        } = header;
        let request = match Request::decode(&request) {
            Ok(request) => request,
            Err(e) => {
                // the frame got here, so this hop and everything below it
                // answer as protocol errors rather than going silent
                warn!("undecodable request for {}: {}", target, e);
                let names = std::iter::once(target)
                    .chain(subtree.into_iter().map(|n| n.name))
                    .collect::<Vec<_>>();
                return Ok(bundle(dispatch_id, failed(&names, ErrorCode::ProtocolError)));
            }
        };
        let budget = Duration::from_micros(timeout_us);
        let deadline = deadline_after(Instant::now(), budget);
        debug!("handling {} with {:?} budget", request.name(), budget);

        let own = async {
            match timeout_at(deadline, self.handler.handle(&request)).await {
                Ok((reply, code)) => ResultEntry::success(target.as_str(), code, reply),
                Err(_) => {
                    warn!("local {} handler missed the deadline", request.name());
                    ResultEntry::failed(target.as_str(), ErrorCode::Timeout)
                }
            }
        };
        let below = self.relay_subtree(
            DispatchId(dispatch_id),
            subtree,
            budget,
            AliasTable::from_wire(aliases, aliases_expire_at),
            &request,
        );
        let (own, below) = futures::join!(own, below);
        let mut list = ResultList::with_capacity(1 + below.len());
        list.insert(own);
        list.extend(below);
        Ok(bundle(dispatch_id, list))
    }

    async fn relay_subtree(
        &self,
        id: DispatchId,
        subtree: Vec<WireNode>,
        budget: Duration,
        aliases: Option<AliasTable>,
        request: &Request,
    ) -> ResultList {
        if subtree.is_empty() {
            return ResultList::new();
        }
        let names = subtree.iter().map(|n| n.name.clone()).collect::<Vec<_>>();

        let tree = match ForwardTree::from_descriptor(subtree) {
            Ok(tree) => tree,
            Err(e) => {
                warn!("rejecting subtree of {} nodes: {}", names.len(), e);
                return failed(&names, e.error_code());
            }
        };
        let spec = ForwardSpec::delegated(id, tree, budget, aliases, request.clone());
        match self.forwarder.dispatch_spec(spec).await {
            Ok(job) => job.forward_wait().await,
            Err(e) => {
                warn!("could not forward to subtree of {} nodes: {}", names.len(), e);
                failed(&names, e.error_code())
            }
        }
    }
}

fn failed(names: &[String], error: ErrorCode) -> ResultList {
    let mut list = ResultList::with_capacity(names.len());
    for name in names {
        list.mark_as_failed_forward(name, error);
    }
    list
}

fn bundle(dispatch_id: u64, list: ResultList) -> ReplyBundle {
    ReplyBundle {
        version: PROTOCOL_VERSION,
        dispatch_id,
        entries: list.iter().map(to_wire_or_flag).collect(),
    }
}

/// Entries whose reply can't be archived go up as `ProtocolError` rather
/// than disappearing from the bundle.
fn to_wire_or_flag(entry: &ResultEntry) -> WireEntry {
    entry.to_wire().unwrap_or_else(|e| {
        warn!("could not encode result for {}: {}", entry.node, e);
        WireEntry {
            node: entry.node.clone(),
            error: ErrorCode::ProtocolError.into(),
            return_code: 0,
            body: Vec::new(),
        }
    })
}
