//! The shared active-request map.
//!
//! Both the connection workers (inbound dispatch, outbound payload resolution) and the
//! [`RequestSet`](super::RequestSet) (lifecycle, control) operate on this registry, which
//! breaks the dependency cycle between the two sides.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};

use tokio::sync::mpsc;
use tracing::trace;

use super::{
    on_conn::TaskInput,
    on_conn_set::{RequestOnConnSet, RocSlot, WorkingData},
    AllNodesHandler, FinishedNotifier, MultiNodeHandler, RequestFinished, RequestId,
    RequestOutcome, RequestType,
};
use crate::{
    addr::NodeAddr,
    error::{AbortReason, Error, ErrorKind, Result},
    id_pool::{IdPool, PoolId},
    runtime::AsyncJoinHandle,
    stats::RequestStats,
};

/// Factory for additional handler instances of a fanned-out request.
#[derive(Clone)]
pub(crate) enum HandlerFactory {
    None,
    MultiNode(MultiNodeHandler),
    AllNodes(AllNodesHandler),
}

struct RequestEntry {
    request_type: RequestType,
    context: Arc<Mutex<Vec<u8>>>,
    finished_notifier: Option<FinishedNotifier>,
    started_at: Instant,
    num_active: usize,
    on_conns: RequestOnConnSet,
    factory: HandlerFactory,
    timeout_task: Option<AsyncJoinHandle<()>>,
    last_error: Option<Error>,
}

struct RegistryInner {
    active: HashMap<RequestId, RequestEntry>,
    /// Monotonically increasing; skips 0, which marks "no request".
    next_id: RequestId,
    roc_pool: IdPool<WorkingData>,
    max_requests: usize,
}

/// Everything needed to construct the task-side `RequestOnConn` for a freshly added slot.
pub(crate) struct RocLease {
    pub(crate) request_id: RequestId,
    pub(crate) pool_id: PoolId,
    pub(crate) input: mpsc::UnboundedReceiver<TaskInput>,
    pub(crate) working: WorkingData,
}

/// A request that just finished, extracted from the registry for finalization outside its
/// lock.
pub(crate) struct FinishedRequest {
    pub(crate) notifier: FinishedNotifier,
    pub(crate) info: RequestFinished,
    pub(crate) timeout_task: Option<AsyncJoinHandle<()>>,
}

pub(crate) struct RequestRegistry {
    inner: Mutex<RegistryInner>,
    stats: Arc<RequestStats>,
}

impl RequestRegistry {
    pub(crate) fn new(max_requests: usize, stats: Arc<RequestStats>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner {
                active: HashMap::new(),
                next_id: 1,
                roc_pool: IdPool::new(),
                max_requests,
            }),
            stats,
        })
    }

    pub(crate) fn stats(&self) -> Arc<RequestStats> {
        self.stats.clone()
    }

    /// Admits a new request, assigns its id and records its context and notifier.
    pub(crate) fn allocate(
        &self,
        request_type: RequestType,
        context: Vec<u8>,
        finished_notifier: FinishedNotifier,
        factory: HandlerFactory,
    ) -> Result<RequestId> {
        let mut inner = self.inner.lock().unwrap();
        if inner.active.len() >= inner.max_requests {
            return Err(ErrorKind::NoMoreRequests.into());
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.active.insert(
            id,
            RequestEntry {
                request_type,
                context: Arc::new(Mutex::new(context)),
                finished_notifier: Some(finished_notifier),
                started_at: Instant::now(),
                num_active: 0,
                on_conns: RequestOnConnSet::for_type(request_type),
                factory,
                timeout_task: None,
                last_error: None,
            },
        );
        self.stats.record_started(request_type);
        Ok(id)
    }

    /// Adds one execution slot to `id`, leased from the pool, optionally bound to a node.
    pub(crate) fn add_roc(&self, id: RequestId, bound: Option<NodeAddr>) -> Result<RocLease> {
        let mut inner = self.inner.lock().unwrap();
        let (pool_id, working) = inner.roc_pool.lease();
        let entry = match inner.active.get_mut(&id) {
            Some(entry) => entry,
            None => {
                inner.roc_pool.release(pool_id, Default::default());
                return Err(Error::internal(format!("request {} is not active", id)));
            }
        };
        let (input_sender, input) = mpsc::unbounded_channel();
        entry.num_active += 1;
        entry.on_conns.insert(RocSlot {
            pool_id,
            input: input_sender,
            bound,
            active: true,
            working: working.clone(),
        });
        Ok(RocLease {
            request_id: id,
            pool_id,
            input,
            working,
        })
    }

    pub(crate) fn is_active(&self, id: RequestId) -> bool {
        self.inner.lock().unwrap().active.contains_key(&id)
    }

    pub(crate) fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }

    pub(crate) fn request_type(&self, id: RequestId) -> Option<RequestType> {
        let inner = self.inner.lock().unwrap();
        inner.active.get(&id).map(|entry| entry.request_type)
    }

    pub(crate) fn num_active_rocs(&self, id: RequestId) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.active.get(&id).map_or(0, |entry| entry.num_active)
    }

    pub(crate) fn context(&self, id: RequestId) -> Option<Arc<Mutex<Vec<u8>>>> {
        let inner = self.inner.lock().unwrap();
        inner.active.get(&id).map(|entry| entry.context.clone())
    }

    pub(crate) fn multi_node_handler(&self, id: RequestId) -> Option<MultiNodeHandler> {
        let inner = self.inner.lock().unwrap();
        match inner.active.get(&id).map(|entry| &entry.factory) {
            Some(HandlerFactory::MultiNode(handler)) => Some(handler.clone()),
            _ => None,
        }
    }

    /// Routes an inbound payload to the slot of `id` bound to `address`. Payloads for
    /// unknown requests or unbound nodes are discarded.
    pub(crate) fn deliver_payload(&self, id: RequestId, address: &NodeAddr, payload: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.active.get_mut(&id) else {
            trace!(request_id = id, "discarding payload for unknown request");
            return;
        };
        match entry.on_conns.find_bound(address) {
            Some(slot) => {
                let _ = slot.input.send(TaskInput::Payload(payload));
            }
            None => trace!(
                request_id = id,
                address = %address,
                "discarding payload for request not bound to this node"
            ),
        }
    }

    /// Updates which node a slot is bound to, so inbound routing follows `use_node` and
    /// round-robin rebinding.
    pub(crate) fn rebind(&self, id: RequestId, pool_id: PoolId, bound: Option<NodeAddr>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.active.get_mut(&id) {
            if let Some(slot) = entry.on_conns.find_by_pool_id(pool_id) {
                slot.bound = bound;
            }
        }
    }

    /// Delivers a connection error to every active slot bound to `address`.
    pub(crate) fn fail_bound(&self, address: &NodeAddr, error: &Error) {
        self.send_bound(address, || TaskInput::ConnError(error.clone()));
    }

    /// Like [`fail_bound`](Self::fail_bound), but for a halted connection that will never
    /// come back: also wakes reconnect waiters.
    pub(crate) fn halt_bound(&self, address: &NodeAddr, error: &Error) {
        self.send_bound(address, || TaskInput::Halted(error.clone()));
    }

    fn send_bound(&self, address: &NodeAddr, mut input: impl FnMut() -> TaskInput) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.active.values_mut() {
            if let Some(slot) = entry.on_conns.find_bound(address) {
                let _ = slot.input.send(input());
            }
        }
    }

    /// Wakes the slot of `id` bound to `address` after its connection came (back) up.
    pub(crate) fn notify_reconnected(&self, id: RequestId, address: &NodeAddr) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.active.get_mut(&id) {
            if let Some(slot) = entry.on_conns.find_bound(address) {
                let _ = slot.input.send(TaskInput::Reconnected);
            }
        }
    }

    /// Queues an abort for every task of `id`. Suspended tasks unwind at their current
    /// suspension point; running tasks at their next one. Returns whether `id` was active.
    pub(crate) fn abort(&self, id: RequestId, reason: AbortReason) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.active.get_mut(&id) else {
            return false;
        };
        for slot in entry.on_conns.iter_mut() {
            if slot.active {
                let _ = slot.input.send(TaskInput::Abort(reason));
            }
        }
        true
    }

    /// Resumes every suspended task of `id` with `code`. Returns whether `id` was active.
    pub(crate) fn resume_suspended(&self, id: RequestId, code: i32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.active.get_mut(&id) else {
            return false;
        };
        for slot in entry.on_conns.iter_mut() {
            if slot.active {
                let _ = slot.input.send(TaskInput::Resumed(code));
            }
        }
        true
    }

    /// Arms (or re-arms) the timeout task of `id`. The previous task, if any, is cancelled.
    /// Returns false (and cancels `task`) when `id` is not active.
    pub(crate) fn set_timeout_task(&self, id: RequestId, task: AsyncJoinHandle<()>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.active.get_mut(&id) else {
            task.abort();
            return false;
        };
        if let Some(previous) = entry.timeout_task.replace(task) {
            previous.abort();
        }
        true
    }

    /// Visits the working buffer of every slot of `id` in slot order. Returns whether `id`
    /// was active.
    pub(crate) fn visit_working_data(
        &self,
        id: RequestId,
        visitor: &mut dyn FnMut(usize, &mut Vec<u8>),
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.active.get_mut(&id) else {
            return false;
        };
        for slot in entry.on_conns.iter_mut() {
            visitor(slot.pool_id.index(), &mut slot.working.lock().unwrap());
        }
        true
    }

    /// Called by each handler task on exit. Marks the slot inactive and, when it was the
    /// last one, removes the request and hands back what finalization needs.
    pub(crate) fn handler_finished(
        &self,
        id: RequestId,
        pool_id: PoolId,
        result: Result<()>,
    ) -> Option<FinishedRequest> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.active.get_mut(&id)?;
        if let Some(slot) = entry.on_conns.find_by_pool_id(pool_id) {
            if !slot.active {
                return None;
            }
            slot.active = false;
        } else {
            return None;
        }
        entry.num_active -= 1;
        if let Err(error) = result {
            entry.last_error = Some(error);
        }
        if entry.num_active > 0 {
            return None;
        }

        // Last task out: tear the request down and recycle its slots.
        let mut entry = inner.active.remove(&id).unwrap();
        for slot in entry.on_conns.reset() {
            slot.working.lock().unwrap().clear();
            inner.roc_pool.release(slot.pool_id, slot.working);
        }
        let context = std::mem::take(&mut *entry.context.lock().unwrap());
        let outcome = match entry.last_error.take() {
            Some(error) => RequestOutcome::Failed(error),
            None => RequestOutcome::Succeeded,
        };
        let elapsed = entry.started_at.elapsed();
        self.stats
            .record_finished(entry.request_type, elapsed, &outcome);
        Some(FinishedRequest {
            notifier: entry.finished_notifier.take()?,
            info: RequestFinished {
                request_id: id,
                request_type: entry.request_type,
                context,
                outcome,
                elapsed,
            },
            timeout_task: entry.timeout_task.take(),
        })
    }

    /// All-nodes requests that do not yet run on the node at `address`, paired with their
    /// handler factories so the caller can spawn the missing instances.
    pub(crate) fn all_nodes_requests_missing(
        &self,
        address: &NodeAddr,
    ) -> Vec<(RequestId, AllNodesHandler)> {
        let inner = self.inner.lock().unwrap();
        inner
            .active
            .iter()
            .filter(|(_, entry)| entry.request_type == RequestType::AllNodes)
            .filter(|(_, entry)| !entry.on_conns.has_node(address.cmp_id()))
            .filter_map(|(id, entry)| match &entry.factory {
                HandlerFactory::AllNodes(handler) => Some((*id, handler.clone())),
                _ => None,
            })
            .collect()
    }
}
