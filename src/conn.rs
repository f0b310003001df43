//! Client-side connections to individual nodes.
//!
//! A [`Connection`] is a cheap-to-clone handle to a worker task that owns the socket. The
//! worker drives the connect/handshake/reconnect cycle and, while connected, a send pump and
//! a receive pump over the two halves of the socket.

mod establish;
pub(crate) mod retry;
mod worker;

use tokio::sync::{mpsc, watch};

use self::worker::ConnCommand;
pub(crate) use self::worker::{shutdown_error, DisconnectCallback, StartupCallback};
use std::sync::Arc;

use crate::{
    addr::NodeAddr,
    credentials::CredentialStore,
    options::ConnectionOptions,
    request::{registry::RequestRegistry, RequestId},
    runtime::reply_channel,
};

/// Lifecycle states of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No socket; either never started or between reconnect attempts.
    Disconnected,
    /// A connect/handshake attempt is in progress.
    Connecting,
    /// The session is established and request traffic flows.
    Connected,
    /// The session is being torn down.
    Shutdown,
}

/// Produces the bytes of one outbound payload at the moment the send pump reaches it.
pub(crate) type PayloadProducer = Box<dyn FnOnce() -> Vec<u8> + Send>;

/// One entry of the outbound queue. The payload is resolved only when the pump dequeues the
/// ticket; if the request has finished by then, the ticket is dropped silently.
pub(crate) struct SendTicket {
    pub(crate) request_id: RequestId,
    pub(crate) produce: PayloadProducer,
    /// Resolved once the payload has been handed to the socket.
    pub(crate) sent: Option<tokio::sync::oneshot::Sender<()>>,
}

/// Outcome of [`Connection::register_for_connected_notification`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RegisterOutcome {
    /// The connection is already up; no notification will follow.
    AlreadyConnected,
    /// The id was added and will be notified on the next reconnect.
    Registered,
    /// The id was already registered; still a single notification will follow.
    AlreadyRegistered,
    /// The connection has been halted and will never reconnect.
    ShutDown,
}

/// Handle to one node connection.
#[derive(Clone, Debug)]
pub(crate) struct Connection {
    address: NodeAddr,
    commands: mpsc::UnboundedSender<ConnCommand>,
    status: watch::Receiver<ConnectionStatus>,
}

impl Connection {
    /// Spawns the worker for a connection to `address` and starts connecting immediately.
    /// Reconnection continues until [`shutdown_and_halt`](Connection::shutdown_and_halt).
    ///
    /// `on_startup` is invoked exactly once per successful connect and once per failed
    /// attempt; `on_disconnect` once per drop of an established session.
    pub(crate) fn start(
        address: NodeAddr,
        registry: Arc<RequestRegistry>,
        credentials: Arc<CredentialStore>,
        options: ConnectionOptions,
        on_startup: StartupCallback,
        on_disconnect: DisconnectCallback,
    ) -> Self {
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let (status_sender, status) = watch::channel(ConnectionStatus::Disconnected);
        worker::spawn(
            address,
            registry,
            credentials,
            options,
            on_startup,
            on_disconnect,
            command_receiver,
            status_sender,
        );
        Self {
            address,
            commands,
            status,
        }
    }

    pub(crate) fn address(&self) -> NodeAddr {
        self.address
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Enqueues an outbound payload ticket. Tickets enqueued while the link is down are
    /// flushed in order on the next successful connect.
    pub(crate) fn send(&self, ticket: SendTicket) {
        // A closed channel means the worker has halted; the ticket is dropped, which
        // resolves the `sent` waiter with an error.
        let _ = self.commands.send(ConnCommand::Send(ticket));
    }

    /// Registers `id` to be woken when the connection next transitions to connected.
    pub(crate) async fn register_for_connected_notification(
        &self,
        id: RequestId,
    ) -> RegisterOutcome {
        let (reply, waiter) = reply_channel();
        if self
            .commands
            .send(ConnCommand::Register { id, reply })
            .is_err()
        {
            return RegisterOutcome::ShutDown;
        }
        waiter.wait().await.unwrap_or(RegisterOutcome::ShutDown)
    }

    /// Removes a reconnect registration. Idempotent.
    pub(crate) fn unregister_for_connected_notification(&self, id: RequestId) {
        let _ = self.commands.send(ConnCommand::Unregister(id));
    }

    /// Shuts the connection down for good: closes the socket, fails every request bound to
    /// it, and stops reconnecting. Resolves once the worker has acted on the command.
    pub(crate) async fn shutdown_and_halt(&self) {
        let (reply, waiter) = reply_channel();
        if self.commands.send(ConnCommand::Halt { reply }).is_ok() {
            let _ = waiter.wait().await;
        }
    }

    pub(crate) fn cmp_id(&self) -> u64 {
        self.address.cmp_id()
    }
}

impl SendTicket {
    pub(crate) fn new(
        request_id: RequestId,
        produce: PayloadProducer,
    ) -> (Self, tokio::sync::oneshot::Receiver<()>) {
        let (sent_tx, sent_rx) = tokio::sync::oneshot::channel();
        (
            Self {
                request_id,
                produce,
                sent: Some(sent_tx),
            },
            sent_rx,
        )
    }
}

impl std::fmt::Debug for SendTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SendTicket")
            .field("request_id", &self.request_id)
            .finish()
    }
}
