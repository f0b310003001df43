use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::{
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    net::TcpStream,
    sync::{mpsc, watch},
};
use tracing::{debug, trace, warn};

use super::{
    establish::Establisher, retry::RetryTimer, ConnectionStatus, RegisterOutcome, SendTicket,
};
use crate::{
    addr::NodeAddr,
    credentials::CredentialStore,
    error::{AbortReason, Error, Result},
    options::ConnectionOptions,
    proto::{Message, MessageType},
    request::{registry::RequestRegistry, RequestId},
    runtime::{self, ReplyHandle},
};

/// Invoked once per successful connect (`None`) and once per failed attempt (`Some(err)`).
pub(crate) type StartupCallback = Box<dyn FnMut(&NodeAddr, Option<&Error>) + Send>;

/// Invoked when an established session drops (not on failed connect attempts and not on
/// halt).
pub(crate) type DisconnectCallback = Box<dyn FnMut(&NodeAddr, &Error) + Send>;

pub(super) enum ConnCommand {
    Send(SendTicket),
    Register {
        id: RequestId,
        reply: ReplyHandle<RegisterOutcome>,
    },
    Unregister(RequestId),
    Halt {
        reply: ReplyHandle<()>,
    },
}

/// The task owning one connection's socket and lifecycle.
struct ConnectionWorker {
    address: NodeAddr,
    registry: Arc<RequestRegistry>,
    establisher: Establisher,
    commands: mpsc::UnboundedReceiver<ConnCommand>,
    status: watch::Sender<ConnectionStatus>,
    on_startup: StartupCallback,
    on_disconnect: DisconnectCallback,

    /// Requests to wake on the next transition to connected. Survives failed reconnect
    /// attempts; drained on every successful connect.
    reconnect_subscribers: HashSet<RequestId>,

    /// Tickets accepted while the link was down, flushed in order once it comes up.
    pending_sends: VecDeque<SendTicket>,

    retry: RetryTimer,
    halted: bool,
}

#[allow(clippy::too_many_arguments)]
pub(super) fn spawn(
    address: NodeAddr,
    registry: Arc<RequestRegistry>,
    credentials: Arc<CredentialStore>,
    options: ConnectionOptions,
    on_startup: StartupCallback,
    on_disconnect: DisconnectCallback,
    commands: mpsc::UnboundedReceiver<ConnCommand>,
    status: watch::Sender<ConnectionStatus>,
) {
    let worker = ConnectionWorker {
        address,
        registry,
        establisher: Establisher::new(credentials, options),
        commands,
        status,
        on_startup,
        on_disconnect,
        reconnect_subscribers: HashSet::new(),
        pending_sends: VecDeque::new(),
        retry: RetryTimer::new(),
        halted: false,
    };
    runtime::spawn(worker.run());
}

impl ConnectionWorker {
    async fn run(mut self) {
        while !self.halted {
            self.set_status(ConnectionStatus::Connecting);
            let stream = match self.connect_with_retry().await {
                Some(stream) => stream,
                None => break,
            };
            self.retry.reset();
            self.set_status(ConnectionStatus::Connected);
            debug!(address = %self.address, "connection established");
            (self.on_startup)(&self.address, None);
            self.notify_reconnected();

            let error = self.run_connected(stream).await;
            self.set_status(ConnectionStatus::Shutdown);
            self.registry.fail_bound(&self.address, &error);
            if !self.halted {
                warn!(address = %self.address, error = %error, "connection dropped");
                (self.on_disconnect)(&self.address, &error);
                self.set_status(ConnectionStatus::Disconnected);
            }
        }

        // Terminal teardown: nothing will ever reconnect, so reconnect waiters and queued
        // sends must not be left hanging. Reconnect subscribers are bound to this
        // connection, so `halt_bound` wakes them too.
        let error = shutdown_error();
        self.registry.halt_bound(&self.address, &error);
        self.reconnect_subscribers.clear();
        self.pending_sends.clear();
        self.set_status(ConnectionStatus::Disconnected);
        trace!(address = %self.address, "connection worker exited");
    }

    /// Repeats connect attempts under the backoff schedule until one succeeds or the
    /// connection is halted. Returns `None` when halted.
    async fn connect_with_retry(&mut self) -> Option<TcpStream> {
        loop {
            self.retry.attempt_starting();
            let establisher = self.establisher.clone();
            let address = self.address;
            let establish = async move { establisher.establish(&address).await };
            tokio::pin!(establish);
            let result = loop {
                tokio::select! {
                    biased;
                    Some(command) = self.commands.recv() => {
                        if self.handle_command_while_down(command) {
                            return None;
                        }
                    }
                    result = &mut establish => break result,
                }
            };
            match result {
                Ok(stream) => return Some(stream),
                Err(error) => {
                    debug!(address = %self.address, error = %error, "connect attempt failed");
                    (self.on_startup)(&self.address, Some(&error));
                    let delay = self.retry.delay_after_failure();
                    if self.back_off(delay).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleeps out a backoff period while still servicing commands. Returns true when the
    /// connection was halted (or abandoned) during the sleep.
    async fn back_off(&mut self, delay: Duration) -> bool {
        let sleep = runtime::delay_for(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command_while_down(command) {
                            return true;
                        }
                    }
                    // All handles dropped; nobody can ever observe this connection again.
                    None => {
                        self.halted = true;
                        return true;
                    }
                },
                _ = &mut sleep => return false,
            }
        }
    }

    /// Command processing outside the connected phase. Returns true on halt.
    fn handle_command_while_down(&mut self, command: ConnCommand) -> bool {
        match command {
            ConnCommand::Send(ticket) => {
                self.pending_sends.push_back(ticket);
                false
            }
            ConnCommand::Register { id, reply } => {
                let outcome = if self.reconnect_subscribers.insert(id) {
                    RegisterOutcome::Registered
                } else {
                    RegisterOutcome::AlreadyRegistered
                };
                reply.reply(outcome);
                false
            }
            ConnCommand::Unregister(id) => {
                self.reconnect_subscribers.remove(&id);
                false
            }
            ConnCommand::Halt { reply } => {
                self.halted = true;
                reply.reply(());
                true
            }
        }
    }

    /// Wakes every request that registered for the connected notification. Each id is
    /// notified exactly once and removed.
    fn notify_reconnected(&mut self) {
        for id in self.reconnect_subscribers.drain() {
            self.registry.notify_reconnected(id, &self.address);
        }
    }

    /// The connected phase: spawn the two pumps and shovel commands until something fails
    /// or the connection is halted. Returns the error that ended the session.
    async fn run_connected(&mut self, stream: TcpStream) -> Error {
        let (reader, writer) = stream.into_split();
        let (queue, queue_receiver) = mpsc::unbounded_channel();
        for ticket in self.pending_sends.drain(..) {
            let _ = queue.send(ticket);
        }
        let mut send_task = runtime::spawn(send_pump(
            writer,
            queue_receiver,
            self.registry.clone(),
        ));
        let mut recv_task = runtime::spawn(receive_pump(
            reader,
            self.registry.clone(),
            self.address,
        ));

        let error = loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(ConnCommand::Send(ticket)) => {
                        let _ = queue.send(ticket);
                    }
                    Some(ConnCommand::Register { reply, .. }) => {
                        reply.reply(RegisterOutcome::AlreadyConnected);
                    }
                    Some(ConnCommand::Unregister(id)) => {
                        self.reconnect_subscribers.remove(&id);
                    }
                    Some(ConnCommand::Halt { reply }) => {
                        self.halted = true;
                        reply.reply(());
                        break shutdown_error();
                    }
                    None => {
                        self.halted = true;
                        break shutdown_error();
                    }
                },
                result = &mut send_task => break flatten_pump_exit(result),
                result = &mut recv_task => break flatten_pump_exit(result),
            }
        };
        send_task.abort();
        recv_task.abort();
        error
    }

    fn set_status(&self, status: ConnectionStatus) {
        // Nobody listening is fine.
        let _ = self.status.send(status);
    }
}

/// Drains the outbound queue onto the socket. Payloads are produced at emission time and
/// entries whose request has finished in the meantime are skipped.
async fn send_pump(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<SendTicket>,
    registry: Arc<RequestRegistry>,
) -> Error {
    while let Some(ticket) = queue.recv().await {
        if !registry.is_active(ticket.request_id) {
            trace!(request_id = ticket.request_id, "dropping payload for finished request");
            continue;
        }
        let payload = (ticket.produce)();
        let message = Message::request(ticket.request_id, &payload);
        if let Err(error) = message.write_to(&mut writer).await {
            return error;
        }
        if let Some(sent) = ticket.sent {
            let _ = sent.send(());
        }
    }
    // The queue closing means the worker is tearing the session down already.
    shutdown_error()
}

/// Reads frames off the socket and routes request payloads to their handlers. Payloads for
/// unknown request ids are discarded.
async fn receive_pump(
    mut reader: OwnedReadHalf,
    registry: Arc<RequestRegistry>,
    address: NodeAddr,
) -> Error {
    loop {
        let message = match Message::read_from(&mut reader).await {
            Ok(message) => message,
            Err(error) => return error,
        };
        match message.header.message_type {
            MessageType::Request => {
                registry.deliver_payload(message.request_id(), &address, message.payload().to_vec());
            }
            MessageType::Authentication => {
                return Error::protocol("authentication message in established session")
            }
        }
    }
}

fn flatten_pump_exit(result: Result<Error>) -> Error {
    match result {
        Ok(error) => error,
        Err(join_error) => join_error,
    }
}

pub(crate) fn shutdown_error() -> Error {
    Error::aborted(AbortReason::Shutdown)
}
