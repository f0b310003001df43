//! The coordinator of all active requests.

use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use tracing::debug;

use super::{
    controller::RequestController,
    on_conn::{
        EventDispatcher, EventDispatcherAllNodes, EventDispatcherMultiNode,
        EventDispatcherRoundRobin, RequestOnConn, CURRENT_REQUEST,
    },
    registry::{HandlerFactory, RequestRegistry},
    AllNodesHandler, FinishedNotifier, MultiNodeHandler, RequestContext, RequestId, RequestType,
    RoundRobinHandler, SingleNodeHandler,
};
use crate::{
    addr::NodeAddr,
    conn::Connection,
    conn_set::ConnectionSet,
    error::{AbortReason, Error, Result},
    runtime,
    stats::StatsSnapshot,
};

/// Starts, controls and finalizes requests. One per client; cheap to clone.
#[derive(Clone)]
pub struct RequestSet {
    registry: Arc<RequestRegistry>,
    connections: Arc<ConnectionSet>,
}

impl RequestSet {
    pub(crate) fn new(registry: Arc<RequestRegistry>, connections: Arc<ConnectionSet>) -> Self {
        Self {
            registry,
            connections,
        }
    }

    /// Starts a request whose handler exchanges messages with the single node at `address`.
    pub fn start_single_node(
        &self,
        address: NodeAddr,
        context: Vec<u8>,
        handler: SingleNodeHandler,
        finished_notifier: FinishedNotifier,
    ) -> Result<RequestId> {
        let conn = self.connections.get(&address).ok_or_else(|| {
            Error::invalid_argument(format!("no connection registered for {}", address))
        })?;
        let id = self.registry.allocate(
            RequestType::SingleNode,
            context,
            finished_notifier,
            HandlerFactory::None,
        )?;
        let roc = self.lease_roc(id, Some(conn), None)?;
        let context = self.request_context(id);
        let pool_id = roc_pool_id(&roc);
        let future = handler(EventDispatcher::new(roc), context);
        self.spawn_handler_task(id, pool_id, future);
        Ok(id)
    }

    /// Starts a request whose handler is offered every connected node in randomized order.
    pub fn start_round_robin(
        &self,
        context: Vec<u8>,
        handler: RoundRobinHandler,
        finished_notifier: FinishedNotifier,
    ) -> Result<RequestId> {
        let id = self.registry.allocate(
            RequestType::RoundRobin,
            context,
            finished_notifier,
            HandlerFactory::None,
        )?;
        let roc = self.lease_roc(id, None, Some(self.connections.clone()))?;
        let context = self.request_context(id);
        let pool_id = roc_pool_id(&roc);
        let future = handler(EventDispatcherRoundRobin::new(roc), context);
        self.spawn_handler_task(id, pool_id, future);
        Ok(id)
    }

    /// Starts a request whose handler picks nodes itself and may spread onto more
    /// connections as it goes.
    pub fn start_multi_node(
        &self,
        context: Vec<u8>,
        handler: MultiNodeHandler,
        finished_notifier: FinishedNotifier,
    ) -> Result<RequestId> {
        let id = self.registry.allocate(
            RequestType::MultiNode,
            context,
            finished_notifier,
            HandlerFactory::MultiNode(handler.clone()),
        )?;
        let roc = self.lease_roc(id, None, Some(self.connections.clone()))?;
        let context = self.request_context(id);
        let pool_id = roc_pool_id(&roc);
        let future = handler(EventDispatcherMultiNode::new(roc), context);
        self.spawn_handler_task(id, pool_id, future);
        Ok(id)
    }

    /// Starts a request with one handler instance per registered node. Nodes added while
    /// the request is live get an instance too.
    pub fn start_all_nodes(
        &self,
        context: Vec<u8>,
        handler: AllNodesHandler,
        finished_notifier: FinishedNotifier,
    ) -> Result<RequestId> {
        let conns = self.connections.connections();
        if conns.is_empty() {
            return Err(Error::invalid_argument(
                "all-nodes request started with no registered nodes",
            ));
        }
        let id = self.registry.allocate(
            RequestType::AllNodes,
            context,
            finished_notifier,
            HandlerFactory::AllNodes(handler.clone()),
        )?;
        for conn in conns {
            self.spawn_all_nodes_instance(id, handler.clone(), conn)?;
        }
        Ok(id)
    }

    fn spawn_all_nodes_instance(
        &self,
        id: RequestId,
        handler: AllNodesHandler,
        conn: Connection,
    ) -> Result<()> {
        let roc = self.lease_roc(id, Some(conn), None)?;
        let context = self.request_context(id);
        let pool_id = roc_pool_id(&roc);
        let future = handler(EventDispatcherAllNodes::new(roc), context);
        self.spawn_handler_task(id, pool_id, future);
        Ok(())
    }

    /// Read/control access to an active request. `expected_type` guards against controlling
    /// a recycled id of a different flavor.
    pub fn get_request_controller(
        &self,
        id: RequestId,
        expected_type: RequestType,
    ) -> Option<RequestController> {
        if self.registry.request_type(id)? != expected_type {
            return None;
        }
        Some(RequestController::new(self.registry.clone(), id))
    }

    /// Aborts every suspended handler task of `id`. Running tasks unwind at their next
    /// suspension point. Returns whether the request was active.
    ///
    /// Calling this from inside one of the request's own handler tasks is forbidden and
    /// fails without touching the request.
    pub fn abort_request(&self, id: RequestId, reason: AbortReason) -> Result<bool> {
        let from_own_task = CURRENT_REQUEST
            .try_with(|current| *current == id)
            .unwrap_or(false);
        if from_own_task {
            return Err(Error::invalid_argument(
                "abort_request called from the request's own handler",
            ));
        }
        Ok(self.registry.abort(id, reason))
    }

    /// Arms a one-shot deadline for `id`; on expiry the request is aborted with
    /// [`AbortReason::Timeout`]. Re-arming replaces the previous deadline. Returns whether
    /// the request was active.
    pub fn set_request_timeout(&self, id: RequestId, timeout: Duration) -> bool {
        let registry = self.registry.clone();
        let task = runtime::spawn(async move {
            runtime::delay_for(timeout).await;
            debug!(request_id = id, "request deadline expired");
            registry.abort(id, AbortReason::Timeout);
        });
        self.registry.set_timeout_task(id, task)
    }

    /// Number of currently active requests.
    pub fn num_active(&self) -> usize {
        self.registry.active_count()
    }

    /// Aggregate timing and outcome counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.registry.stats().snapshot()
    }

    fn lease_roc(
        &self,
        id: RequestId,
        conn: Option<Connection>,
        conn_set: Option<Arc<ConnectionSet>>,
    ) -> Result<RequestOnConn> {
        let bound = conn.as_ref().map(Connection::address);
        let lease = self.registry.add_roc(id, bound)?;
        Ok(RequestOnConn::new(lease, self.registry.clone(), conn, conn_set))
    }

    fn request_context(&self, id: RequestId) -> RequestContext {
        let bytes = self
            .registry
            .context(id)
            .expect("context queried for request that was just allocated");
        RequestContext::new(id, bytes)
    }

    fn spawn_handler_task(
        &self,
        id: RequestId,
        pool_id: crate::id_pool::PoolId,
        future: BoxFuture<'static, Result<()>>,
    ) {
        spawn_handler_task(self.registry.clone(), id, pool_id, future)
    }
}

fn roc_pool_id(roc: &RequestOnConn) -> crate::id_pool::PoolId {
    roc.pool_id()
}

/// Runs one handler instance to completion and funnels its exit through the single
/// finalization path: the last instance out fires the finished notifier exactly once.
pub(crate) fn spawn_handler_task(
    registry: Arc<RequestRegistry>,
    id: RequestId,
    pool_id: crate::id_pool::PoolId,
    future: BoxFuture<'static, Result<()>>,
) {
    runtime::spawn(CURRENT_REQUEST.scope(id, async move {
        let result = future.await;
        if let Some(finished) = registry.handler_finished(id, pool_id, result) {
            if let Some(timeout_task) = finished.timeout_task {
                timeout_task.abort();
            }
            debug!(
                request_id = id,
                success = finished.info.outcome.is_success(),
                "request finished"
            );
            (finished.notifier)(finished.info);
        }
    }));
}

/// Spawns an additional multi-node handler instance bound to `conn`.
pub(crate) fn spawn_multi_node_instance(
    registry: &Arc<RequestRegistry>,
    conn_set: &Arc<ConnectionSet>,
    id: RequestId,
    handler: MultiNodeHandler,
    conn: Connection,
) -> Result<()> {
    let lease = registry.add_roc(id, Some(conn.address()))?;
    let pool_id = lease.pool_id;
    let roc = RequestOnConn::new(
        lease,
        registry.clone(),
        Some(conn),
        Some(conn_set.clone()),
    );
    let context = RequestContext::new(
        id,
        registry
            .context(id)
            .ok_or_else(|| Error::internal("request vanished while spawning instance"))?,
    );
    let future = handler(EventDispatcherMultiNode::new(roc), context);
    spawn_handler_task(registry.clone(), id, pool_id, future);
    Ok(())
}

/// Extends every live all-nodes request onto a connection that was just added to the set.
pub(crate) fn extend_all_nodes_requests(registry: &Arc<RequestRegistry>, conn: &Connection) {
    for (id, handler) in registry.all_nodes_requests_missing(&conn.address()) {
        let Ok(lease) = registry.add_roc(id, Some(conn.address())) else {
            continue;
        };
        let pool_id = lease.pool_id;
        let roc = RequestOnConn::new(lease, registry.clone(), Some(conn.clone()), None);
        let Some(bytes) = registry.context(id) else {
            continue;
        };
        let context = RequestContext::new(id, bytes);
        let future = handler(EventDispatcherAllNodes::new(roc), context);
        spawn_handler_task(registry.clone(), id, pool_id, future);
    }
}
