//! The request multiplexer: user-visible requests, their per-connection execution state, and
//! the coordinator that drives them.

pub(crate) mod controller;
pub(crate) mod on_conn;
pub(crate) mod on_conn_set;
pub(crate) mod registry;
pub(crate) mod set;
pub mod suspendable;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::future::BoxFuture;

pub use self::{
    controller::RequestController,
    on_conn::{
        EventDispatcher, EventDispatcherAllNodes, EventDispatcherMultiNode,
        EventDispatcherRoundRobin, NodeScope, ReconnectOutcome, RocEvent, SendReceiveOutcome,
    },
    set::RequestSet,
};
use crate::error::{Error, Result};

/// Identifies one user-visible request. 0 is reserved and never assigned.
pub type RequestId = u64;

/// Cap on concurrently active requests per [`RequestSet`].
pub const MAX_REQUESTS: usize = 5000;

/// How a request fans out over the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    /// One handler on one named node.
    SingleNode,
    /// One handler trying nodes in randomized order until one serves it.
    RoundRobin,
    /// One or more handlers on nodes the handler picks itself.
    MultiNode,
    /// One handler instance per node, extended onto nodes added later.
    AllNodes,
}

impl RequestType {
    pub(crate) fn index(&self) -> usize {
        match self {
            RequestType::SingleNode => 0,
            RequestType::RoundRobin => 1,
            RequestType::MultiNode => 2,
            RequestType::AllNodes => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestType::SingleNode => "single_node",
            RequestType::RoundRobin => "round_robin",
            RequestType::MultiNode => "multi_node",
            RequestType::AllNodes => "all_nodes",
        }
    }
}

/// Shared view of a request's packed user context. Handlers and the controller see the same
/// bytes; the final contents are handed to the finished notifier.
#[derive(Clone, Debug)]
pub struct RequestContext {
    request_id: RequestId,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl RequestContext {
    pub(crate) fn new(request_id: RequestId, bytes: Arc<Mutex<Vec<u8>>>) -> Self {
        Self { request_id, bytes }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Runs `f` with exclusive access to the context bytes.
    pub fn with<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.bytes.lock().unwrap())
    }
}

/// Why a finished request ended the way it did.
#[derive(Debug)]
pub enum RequestOutcome {
    /// Every handler instance ran to completion without error.
    Succeeded,
    /// At least one handler instance failed; the most recent error is carried.
    Failed(Error),
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Succeeded)
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            RequestOutcome::Succeeded => None,
            RequestOutcome::Failed(error) => Some(error),
        }
    }
}

/// Delivered to the finished notifier exactly once per request, whatever way it ended.
#[derive(Debug)]
pub struct RequestFinished {
    pub request_id: RequestId,
    pub request_type: RequestType,
    /// The packed context in its final state.
    pub context: Vec<u8>,
    pub outcome: RequestOutcome,
    pub elapsed: Duration,
}

/// Invoked exactly once when the last handler instance of a request has exited.
pub type FinishedNotifier = Box<dyn FnOnce(RequestFinished) + Send>;

/// Handler of a single-node request: drives the exchange with one node.
pub type SingleNodeHandler =
    Box<dyn FnOnce(EventDispatcher, RequestContext) -> BoxFuture<'static, Result<()>> + Send>;

/// Handler of a round-robin request: offered each connected node in randomized order.
pub type RoundRobinHandler = Box<
    dyn FnOnce(EventDispatcherRoundRobin, RequestContext) -> BoxFuture<'static, Result<()>> + Send,
>;

/// Handler factory of a multi-node request; invoked once per handler instance the request
/// spreads onto.
pub type MultiNodeHandler = Arc<
    dyn Fn(EventDispatcherMultiNode, RequestContext) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

/// Handler factory of an all-nodes request; invoked once per node, including nodes added
/// while the request is live.
pub type AllNodesHandler = Arc<
    dyn Fn(EventDispatcherAllNodes, RequestContext) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;
