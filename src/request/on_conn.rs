//! Task-side execution state of one request-on-connection and the dispatchers handlers use
//! to exchange messages with nodes.
//!
//! A handler only ever suspends inside a dispatcher method. Every such await point first
//! services the task input channel, which is where aborts, connection errors, reconnect
//! wakeups and user resumes arrive; this is what makes cancellation and resumption safe
//! without any preemption.

use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use super::{on_conn_set::WorkingData, registry::RequestRegistry, registry::RocLease, RequestId};
use crate::{
    addr::NodeAddr,
    conn::{Connection, RegisterOutcome, SendTicket},
    conn_set::ConnectionSet,
    error::{AbortReason, Error, Result},
    id_pool::PoolId,
};

tokio::task_local! {
    /// The request whose handler the current task is running. Used to reject aborts issued
    /// from within the aborted request's own handler.
    pub(crate) static CURRENT_REQUEST: RequestId;
}

/// Input fed to a handler task by the rest of the system.
#[derive(Debug)]
pub(crate) enum TaskInput {
    /// An inbound payload from the bound connection, in wire order.
    Payload(Vec<u8>),
    /// The bound connection transitioned to connected after a registration.
    Reconnected,
    /// The user resumed suspended handlers with this code.
    Resumed(i32),
    /// The bound connection dropped; it will retry in the background.
    ConnError(Error),
    /// The bound connection was halted and will never come back.
    Halted(Error),
    /// The request is being aborted.
    Abort(AbortReason),
}

/// One execution of a request handler, bound to at most one connection at a time.
pub(crate) struct RequestOnConn {
    request_id: RequestId,
    pool_id: PoolId,
    registry: Arc<RequestRegistry>,
    input: mpsc::UnboundedReceiver<TaskInput>,
    conn: Option<Connection>,
    conn_set: Option<Arc<ConnectionSet>>,
    working: WorkingData,
    /// Payloads (and stray resumes) that arrived while the task was awaiting something
    /// else; drained before the input channel.
    stashed: VecDeque<TaskInput>,
    /// A send whose ticket is queued but not yet emitted by the send pump.
    pending_send: Option<oneshot::Receiver<()>>,
}

/// What resumed a task that was waiting in [`receive_event`](EventDispatcher::receive_event).
#[derive(Debug)]
pub enum RocEvent {
    /// The next inbound payload.
    Payload(Vec<u8>),
    /// The user resumed suspended handlers with this code.
    Resumed(i32),
}

/// First completion of a simultaneous send/receive.
#[derive(Debug)]
pub enum SendReceiveOutcome {
    /// The queued payload reached the socket.
    Sent,
    /// An inbound payload arrived first; the send is still pending.
    Received(Vec<u8>),
    /// The user resumed the task first; the send is still pending.
    Resumed(i32),
}

/// How [`wait_for_reconnect`](EventDispatcherAllNodes::wait_for_reconnect) returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// The connection was already up; nothing was waited for.
    AlreadyConnected,
    /// The connection came up while waiting.
    Reconnected,
    /// The user resumed the task before the connection came up.
    Resumed(i32),
}

impl RequestOnConn {
    pub(crate) fn new(
        lease: RocLease,
        registry: Arc<RequestRegistry>,
        conn: Option<Connection>,
        conn_set: Option<Arc<ConnectionSet>>,
    ) -> Self {
        Self {
            request_id: lease.request_id,
            pool_id: lease.pool_id,
            registry,
            input: lease.input,
            conn,
            conn_set,
            working: lease.working,
            stashed: VecDeque::new(),
            pending_send: None,
        }
    }

    pub(crate) fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub(crate) fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    fn bound_address(&self) -> Option<NodeAddr> {
        self.conn.as_ref().map(Connection::address)
    }

    fn bound_conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::internal("handler used the wire without a bound connection"))
    }

    /// Binds the task to `conn` and updates inbound routing accordingly.
    fn bind(&mut self, conn: Connection) {
        let address = conn.address();
        self.conn = Some(conn);
        self.registry
            .rebind(self.request_id, self.pool_id, Some(address));
    }

    fn unbind(&mut self) {
        self.conn = None;
        self.registry.rebind(self.request_id, self.pool_id, None);
    }

    fn disconnect_error(&self, cause: &Error) -> Error {
        match self.bound_address() {
            Some(address) => Error::disconnected(address, cause),
            None => cause.clone(),
        }
    }

    async fn recv_input(&mut self) -> Result<TaskInput> {
        if let Some(input) = self.stashed.pop_front() {
            return Ok(input);
        }
        self.input
            .recv()
            .await
            .ok_or_else(|| Error::internal("request input channel closed"))
    }

    /// Awaits the next inbound payload, discarding stray resume signals.
    async fn receive_payload(&mut self) -> Result<Vec<u8>> {
        loop {
            match self.recv_input().await? {
                TaskInput::Payload(payload) => return Ok(payload),
                TaskInput::Resumed(code) => {
                    trace!(request_id = self.request_id, code, "ignoring resume while receiving");
                }
                TaskInput::Reconnected => {}
                TaskInput::Abort(reason) => return Err(Error::aborted(reason)),
                TaskInput::ConnError(cause) | TaskInput::Halted(cause) => {
                    return Err(self.disconnect_error(&cause))
                }
            }
        }
    }

    /// Awaits the next payload or user resume.
    async fn receive_event(&mut self) -> Result<RocEvent> {
        loop {
            match self.recv_input().await? {
                TaskInput::Payload(payload) => return Ok(RocEvent::Payload(payload)),
                TaskInput::Resumed(code) => return Ok(RocEvent::Resumed(code)),
                TaskInput::Reconnected => {}
                TaskInput::Abort(reason) => return Err(Error::aborted(reason)),
                TaskInput::ConnError(cause) | TaskInput::Halted(cause) => {
                    return Err(self.disconnect_error(&cause))
                }
            }
        }
    }

    /// Queues `producer` on the bound connection. At most one send can be pending at a time.
    fn start_send(
        &mut self,
        producer: impl FnOnce() -> Vec<u8> + Send + 'static,
    ) -> Result<()> {
        if self.pending_send.is_some() {
            return Err(Error::internal("a send is already pending on this handler"));
        }
        let conn = self.bound_conn()?.clone();
        let (ticket, sent) = SendTicket::new(self.request_id, Box::new(producer));
        conn.send(ticket);
        self.pending_send = Some(sent);
        Ok(())
    }

    /// Awaits the pending send to completion, stashing payloads that arrive meanwhile.
    async fn finish_send(&mut self) -> Result<()> {
        loop {
            match self.send_or_receive().await? {
                SendReceiveOutcome::Sent => return Ok(()),
                SendReceiveOutcome::Received(payload) => {
                    self.stashed.push_back(TaskInput::Payload(payload));
                }
                SendReceiveOutcome::Resumed(code) => {
                    self.stashed.push_back(TaskInput::Resumed(code));
                }
            }
        }
    }

    /// Awaits whichever happens first: the pending send reaching the socket, or the next
    /// inbound payload / user resume. Without a pending send this is a plain receive.
    async fn send_or_receive(&mut self) -> Result<SendReceiveOutcome> {
        let Some(mut sent) = self.pending_send.take() else {
            return Ok(match self.receive_event().await? {
                RocEvent::Payload(payload) => SendReceiveOutcome::Received(payload),
                RocEvent::Resumed(code) => SendReceiveOutcome::Resumed(code),
            });
        };

        if let Some(input) = self.stashed.pop_front() {
            self.pending_send = Some(sent);
            return self.interpret_while_sending(input);
        }

        loop {
            tokio::select! {
                biased;
                result = &mut sent => {
                    return match result {
                        Ok(()) => Ok(SendReceiveOutcome::Sent),
                        // The ticket was dropped: the connection worker halted underneath us.
                        Err(_) => Err(self.disconnect_error(&crate::conn::shutdown_error())),
                    };
                }
                input = self.input.recv() => {
                    let Some(input) = input else {
                        return Err(Error::internal("request input channel closed"));
                    };
                    match input {
                        TaskInput::Reconnected => continue,
                        input => {
                            self.pending_send = Some(sent);
                            return self.interpret_while_sending(input);
                        }
                    }
                }
            }
        }
    }

    fn interpret_while_sending(&mut self, input: TaskInput) -> Result<SendReceiveOutcome> {
        match input {
            TaskInput::Payload(payload) => Ok(SendReceiveOutcome::Received(payload)),
            TaskInput::Resumed(code) => Ok(SendReceiveOutcome::Resumed(code)),
            TaskInput::Abort(reason) => {
                self.pending_send = None;
                Err(Error::aborted(reason))
            }
            TaskInput::ConnError(cause) | TaskInput::Halted(cause) => {
                self.pending_send = None;
                Err(self.disconnect_error(&cause))
            }
            TaskInput::Reconnected => unreachable!("reconnect input handled by caller"),
        }
    }

    /// Sends one payload and waits until it reached the socket.
    async fn send(&mut self, producer: impl FnOnce() -> Vec<u8> + Send + 'static) -> Result<()> {
        self.start_send(producer)?;
        self.finish_send().await
    }

    /// Suspends until the bound connection is connected, the user resumes the task, or the
    /// request ends. The link dropping again while waiting is not an error.
    async fn wait_for_reconnect(&mut self) -> Result<ReconnectOutcome> {
        let conn = self.bound_conn()?.clone();
        match conn
            .register_for_connected_notification(self.request_id)
            .await
        {
            RegisterOutcome::AlreadyConnected => return Ok(ReconnectOutcome::AlreadyConnected),
            RegisterOutcome::ShutDown => {
                return Err(self.disconnect_error(&crate::conn::shutdown_error()))
            }
            RegisterOutcome::Registered | RegisterOutcome::AlreadyRegistered => {}
        }
        loop {
            match self.recv_input().await? {
                TaskInput::Reconnected => return Ok(ReconnectOutcome::Reconnected),
                TaskInput::Resumed(code) => {
                    conn.unregister_for_connected_notification(self.request_id);
                    return Ok(ReconnectOutcome::Resumed(code));
                }
                TaskInput::Payload(payload) => {
                    self.stashed.push_back(TaskInput::Payload(payload));
                }
                // The link going down (again) is exactly what we are waiting out.
                TaskInput::ConnError(_) => {}
                TaskInput::Halted(cause) => return Err(self.disconnect_error(&cause)),
                TaskInput::Abort(reason) => {
                    conn.unregister_for_connected_notification(self.request_id);
                    return Err(Error::aborted(reason));
                }
            }
        }
    }
}

/// Scoped access to the wire for a handler. At most one dispatcher exists per
/// request-on-connection; ownership enforces it.
pub struct EventDispatcher {
    roc: RequestOnConn,
}

impl EventDispatcher {
    pub(crate) fn new(roc: RequestOnConn) -> Self {
        Self { roc }
    }

    /// The id of the request this handler runs for.
    pub fn request_id(&self) -> RequestId {
        self.roc.request_id()
    }

    /// The node this handler is currently bound to, if any.
    pub fn address(&self) -> Option<NodeAddr> {
        self.roc.bound_address()
    }

    /// Whether the handler is currently bound to a connection with this remote address.
    pub fn connected_to(&self, address: &NodeAddr) -> bool {
        self.roc.bound_address().as_ref() == Some(address)
    }

    /// Runs `f` over this handler instance's working buffer.
    pub fn with_working_data<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.roc.working.lock().unwrap())
    }

    /// Sends one payload to the bound node, suspending until it reached the socket.
    pub async fn send(
        &mut self,
        producer: impl FnOnce() -> Vec<u8> + Send + 'static,
    ) -> Result<()> {
        self.roc.send(producer).await
    }

    /// Suspends until the next payload from the bound node arrives.
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        self.roc.receive_payload().await
    }

    /// Like [`receive`](Self::receive), but also surfaces user resumes.
    pub async fn receive_event(&mut self) -> Result<RocEvent> {
        self.roc.receive_event().await
    }

    /// Queues a send and suspends until either the payload reached the socket or an inbound
    /// message / resume arrived, whichever happens first.
    pub async fn send_receive(
        &mut self,
        producer: impl FnOnce() -> Vec<u8> + Send + 'static,
    ) -> Result<SendReceiveOutcome> {
        self.roc.start_send(producer)?;
        self.roc.send_or_receive().await
    }

    /// Continues a [`send_receive`](Self::send_receive) whose send is still pending.
    pub async fn send_pending_or_receive(&mut self) -> Result<SendReceiveOutcome> {
        self.roc.send_or_receive().await
    }
}

/// Dispatcher for all-nodes handlers: everything [`EventDispatcher`] does, plus waiting out
/// reconnects of the bound connection.
pub struct EventDispatcherAllNodes {
    inner: EventDispatcher,
}

impl EventDispatcherAllNodes {
    pub(crate) fn new(roc: RequestOnConn) -> Self {
        Self {
            inner: EventDispatcher::new(roc),
        }
    }

    /// Suspends the handler until the bound connection is connected. Returns immediately
    /// with [`ReconnectOutcome::AlreadyConnected`] when it already is; surfaces an explicit
    /// user resume instead of waiting further.
    pub async fn wait_for_reconnect(&mut self) -> Result<ReconnectOutcome> {
        self.inner.roc.wait_for_reconnect().await
    }

    /// Number of handler instances of this request still running.
    pub fn num_active(&self) -> usize {
        let roc = &self.inner.roc;
        roc.registry.num_active_rocs(roc.request_id)
    }
}

impl Deref for EventDispatcherAllNodes {
    type Target = EventDispatcher;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for EventDispatcherAllNodes {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Exclusive use of one node's connection within a multi-node or round-robin handler. The
/// binding is released when the scope drops.
pub struct NodeScope<'a> {
    dispatcher: &'a mut EventDispatcher,
}

impl Deref for NodeScope<'_> {
    type Target = EventDispatcher;

    fn deref(&self) -> &Self::Target {
        self.dispatcher
    }
}

impl DerefMut for NodeScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.dispatcher
    }
}

impl Drop for NodeScope<'_> {
    fn drop(&mut self) {
        self.dispatcher.roc.unbind();
    }
}

/// Dispatcher for multi-node handlers: the handler picks the nodes itself.
pub struct EventDispatcherMultiNode {
    inner: EventDispatcher,
}

impl EventDispatcherMultiNode {
    pub(crate) fn new(roc: RequestOnConn) -> Self {
        Self {
            inner: EventDispatcher::new(roc),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.inner.request_id()
    }

    /// Binds the handler to the connection of `address` for the lifetime of the returned
    /// scope.
    pub fn use_node(&mut self, address: NodeAddr) -> Result<NodeScope<'_>> {
        let conn_set = self.conn_set()?;
        let conn = conn_set.get(&address).ok_or_else(|| {
            Error::invalid_argument(format!("no connection registered for {}", address))
        })?;
        self.inner.roc.bind(conn);
        Ok(NodeScope {
            dispatcher: &mut self.inner,
        })
    }

    /// Spawns another handler instance of the same request, bound to the connection of
    /// `address`.
    pub fn start_on_new_connection(&self, address: NodeAddr) -> Result<()> {
        let conn_set = self.conn_set()?;
        let conn = conn_set.get(&address).ok_or_else(|| {
            Error::invalid_argument(format!("no connection registered for {}", address))
        })?;
        let roc = &self.inner.roc;
        let handler = roc
            .registry
            .multi_node_handler(roc.request_id)
            .ok_or_else(|| Error::internal("request has no multi-node handler factory"))?;
        super::set::spawn_multi_node_instance(
            &roc.registry,
            &conn_set,
            roc.request_id,
            handler,
            conn,
        )
    }

    fn conn_set(&self) -> Result<Arc<ConnectionSet>> {
        self.inner
            .roc
            .conn_set
            .clone()
            .ok_or_else(|| Error::internal("multi-node handler without a connection set"))
    }
}

/// Dispatcher for round-robin handlers: offers every connected node once, in randomized
/// order.
pub struct EventDispatcherRoundRobin {
    inner: EventDispatcher,
    candidates: Option<Vec<Connection>>,
    next: usize,
}

impl EventDispatcherRoundRobin {
    pub(crate) fn new(roc: RequestOnConn) -> Self {
        Self {
            inner: EventDispatcher::new(roc),
            candidates: None,
            next: 0,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.inner.request_id()
    }

    /// Binds the handler to the next connected candidate, or returns `None` once every
    /// candidate has been offered. The order is shuffled once per request.
    pub fn next_node(&mut self) -> Result<Option<NodeScope<'_>>> {
        if self.candidates.is_none() {
            let conn_set = self
                .inner
                .roc
                .conn_set
                .clone()
                .ok_or_else(|| Error::internal("round-robin handler without a connection set"))?;
            self.candidates = Some(conn_set.shuffled_snapshot());
        }
        loop {
            let conn = {
                let candidates = self.candidates.as_ref().unwrap();
                match candidates.get(self.next) {
                    Some(conn) => conn.clone(),
                    None => return Ok(None),
                }
            };
            self.next += 1;
            if conn.is_connected() {
                self.inner.roc.bind(conn);
                return Ok(Some(NodeScope {
                    dispatcher: &mut self.inner,
                }));
            }
        }
    }
}
