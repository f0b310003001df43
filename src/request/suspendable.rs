//! State machine for all-nodes streaming requests that the user can suspend, resume and
//! stop while they run.
//!
//! Each handler instance of such a request embeds a [`SuspendableRequest`] and drives it
//! through its states; all instances of one request alias a single [`SharedWorking`], whose
//! acknowledgement counters gate user-driven state changes:
//!
//! ```text
//! EstablishingConnection → Initialising → Receiving ⇄ RequestingStateChange → Exit
//! ```

use std::sync::{Arc, Mutex};

use super::{
    controller::RequestController,
    on_conn::{EventDispatcherAllNodes, ReconnectOutcome, RocEvent, SendReceiveOutcome},
};
use crate::{
    error::{Error, Result},
    proto::StatusCode,
};

/// Resume code used to push suspended handlers into the `RequestingStateChange` state.
pub const RESUME_CODE_STATE_CHANGE: i32 = 1;

/// The stream state the user most recently asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DesiredState {
    /// No state has been requested yet.
    None,
    /// The node should send (or keep sending) stream data.
    Running,
    /// The node should hold stream data until resumed.
    Suspended,
    /// The stream should end on every node.
    Stopped,
}

/// States a handler instance moves through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Waiting for the bound connection to be up.
    EstablishingConnection,
    /// Exchanging the request initialisation with the node.
    Initialising,
    /// Consuming stream data.
    Receiving,
    /// Signalling a user-requested state change and awaiting its acknowledgement.
    RequestingStateChange,
    /// The handler instance is done.
    Exit,
}

/// How a handler classifies one inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageClass {
    /// Acknowledges the pending state change.
    Ack,
    /// The node ended the stream.
    Exit,
    /// Ordinary stream data; keep going.
    Continue,
    /// Not a recognised message.
    Undefined,
}

struct SharedInner {
    desired: DesiredState,
    /// Handler instances inside an initialisation or state-change exchange. State changes
    /// are admissible only while this is zero.
    waiting_for_ack: usize,
    /// Handler instances that have completed their initial handshake with their node.
    initialised: usize,
    first_initialisation_fired: bool,
}

/// State shared by every handler instance of one suspendable request.
pub struct SharedWorking {
    inner: Mutex<SharedInner>,
}

impl SharedWorking {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SharedInner {
                desired: DesiredState::Running,
                waiting_for_ack: 0,
                initialised: 0,
                first_initialisation_fired: false,
            }),
        })
    }

    pub fn desired_state(&self) -> DesiredState {
        self.inner.lock().unwrap().desired
    }

    /// Requests a state change on behalf of the user.
    ///
    /// Fails (returns false) while any handler instance is awaiting an acknowledgement; the
    /// rejected request is not queued. On success, `begin` runs when at least one instance
    /// has initialised (it should resume the suspended handlers so each signals the change
    /// to its node); otherwise `state_changed` runs immediately, since no node has been
    /// contacted yet.
    pub fn set_desired_state(
        &self,
        new_state: DesiredState,
        begin: impl FnOnce(),
        state_changed: impl FnOnce(),
    ) -> bool {
        let initialised = {
            let mut inner = self.inner.lock().unwrap();
            if inner.waiting_for_ack > 0 {
                return false;
            }
            inner.desired = new_state;
            inner.initialised
        };
        if initialised > 0 {
            begin();
        } else {
            state_changed();
        }
        true
    }

    /// Enters an acknowledgement window and snapshots the state being signalled.
    fn begin_ack_wait(&self) -> DesiredState {
        let mut inner = self.inner.lock().unwrap();
        inner.waiting_for_ack += 1;
        inner.desired
    }

    /// Leaves the acknowledgement window. True when this was the last instance waiting.
    fn end_ack_wait(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.waiting_for_ack -= 1;
        inner.waiting_for_ack == 0
    }

    /// Counts one instance as initialised. True exactly once: when every active instance
    /// has initialised for the first time.
    fn note_initialised(&self, num_active: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.initialised += 1;
        if !inner.first_initialisation_fired && inner.initialised >= num_active {
            inner.first_initialisation_fired = true;
            return true;
        }
        false
    }

    #[cfg(test)]
    pub(crate) fn waiting_for_ack(&self) -> usize {
        self.inner.lock().unwrap().waiting_for_ack
    }

    #[cfg(test)]
    pub(crate) fn initialised(&self) -> usize {
        self.inner.lock().unwrap().initialised
    }
}

/// Drives one handler instance of a suspendable streaming request.
pub struct SuspendableRequest<'a> {
    dispatcher: &'a mut EventDispatcherAllNodes,
    shared: Arc<SharedWorking>,
}

impl<'a> SuspendableRequest<'a> {
    pub fn new(dispatcher: &'a mut EventDispatcherAllNodes, shared: Arc<SharedWorking>) -> Self {
        Self { dispatcher, shared }
    }

    /// Waits until the bound connection is up. A user resume while waiting only matters if
    /// the user asked to stop; any other desired state keeps the wait going.
    pub async fn establish_connection(&mut self) -> Result<StreamState> {
        loop {
            match self.dispatcher.wait_for_reconnect().await? {
                ReconnectOutcome::AlreadyConnected | ReconnectOutcome::Reconnected => {
                    return Ok(StreamState::Initialising)
                }
                ReconnectOutcome::Resumed(_) => {
                    if self.shared.desired_state() == DesiredState::Stopped {
                        return Ok(StreamState::Exit);
                    }
                }
            }
        }
    }

    /// Sends the request initialisation payload and consumes the node's status reply.
    /// `on_status` sees every status; a non-OK status ends this instance. The
    /// `on_first_initialisation` callback fires on whichever instance completes the last
    /// outstanding initial handshake, exactly once per request.
    pub async fn initialise(
        &mut self,
        payload: impl FnOnce() -> Vec<u8> + Send + 'static,
        on_status: impl FnOnce(StatusCode),
        on_first_initialisation: impl FnOnce(),
    ) -> Result<StreamState> {
        let before = self.shared.begin_ack_wait();
        let result = self.exchange_initialisation(payload).await;
        self.shared.end_ack_wait();
        let status = result?;
        on_status(status);
        if !status.is_ok() {
            return Ok(StreamState::Exit);
        }
        if self.shared.note_initialised(self.dispatcher.num_active()) {
            on_first_initialisation();
        }
        if self.shared.desired_state() != before {
            return Ok(StreamState::RequestingStateChange);
        }
        Ok(StreamState::Receiving)
    }

    async fn exchange_initialisation(
        &mut self,
        payload: impl FnOnce() -> Vec<u8> + Send + 'static,
    ) -> Result<StatusCode> {
        self.dispatcher.send(payload).await?;
        let reply = self.dispatcher.receive().await?;
        match reply.first() {
            Some(&status) => StatusCode::from_u8(status),
            None => Err(Error::protocol("empty status reply to initialisation")),
        }
    }

    /// Consumes the next stream message, or notices that the user requested a state change.
    pub async fn receive(
        &mut self,
        mut on_message: impl FnMut(&[u8]) -> MessageClass,
    ) -> Result<StreamState> {
        match self.dispatcher.receive_event().await? {
            RocEvent::Payload(payload) => match on_message(&payload) {
                MessageClass::Continue => Ok(StreamState::Receiving),
                MessageClass::Exit => Ok(StreamState::Exit),
                MessageClass::Ack | MessageClass::Undefined => Err(Error::protocol(
                    "unexpected acknowledgement or undefined message in stream",
                )),
            },
            RocEvent::Resumed(_) => Ok(StreamState::RequestingStateChange),
        }
    }

    /// Signals the current desired state to the node and drains interleaved stream
    /// messages until the node acknowledges. `on_state_changed` fires on whichever
    /// instance collects the last outstanding acknowledgement, exactly once per change.
    pub async fn request_state_change(
        &mut self,
        control_payload: impl FnOnce(DesiredState) -> Vec<u8>,
        mut on_message: impl FnMut(&[u8]) -> MessageClass,
        on_state_changed: impl FnOnce(),
    ) -> Result<StreamState> {
        let signaled = self.shared.begin_ack_wait();
        let payload = control_payload(signaled);
        let result = self.signal_and_await_ack(payload, &mut on_message).await;
        if self.shared.end_ack_wait() {
            on_state_changed();
        }
        let node_ended_stream = result?;
        if node_ended_stream {
            return Ok(StreamState::Exit);
        }
        // The user may have requested another change during a callback.
        if self.shared.desired_state() != signaled {
            return Ok(StreamState::RequestingStateChange);
        }
        if signaled == DesiredState::Stopped {
            return Ok(StreamState::Exit);
        }
        Ok(StreamState::Receiving)
    }

    /// Runs the send of the control message concurrently with inbound processing. Returns
    /// whether the node ended the stream instead of acknowledging.
    async fn signal_and_await_ack(
        &mut self,
        payload: Vec<u8>,
        on_message: &mut impl FnMut(&[u8]) -> MessageClass,
    ) -> Result<bool> {
        let mut outcome = self.dispatcher.send_receive(move || payload).await?;
        loop {
            match outcome {
                SendReceiveOutcome::Sent => {}
                SendReceiveOutcome::Received(message) => match on_message(&message) {
                    MessageClass::Ack => return Ok(false),
                    MessageClass::Exit => return Ok(true),
                    MessageClass::Continue => {}
                    MessageClass::Undefined => {
                        return Err(Error::protocol("undefined message while changing state"))
                    }
                },
                // Inadmissible while we hold the ack window; ignore.
                SendReceiveOutcome::Resumed(_) => {}
            }
            outcome = self.dispatcher.send_pending_or_receive().await?;
        }
    }
}

/// User-side controls of one suspendable request, mapping start/suspend/resume/stop onto
/// desired-state changes.
#[derive(Clone)]
pub struct StreamController {
    controller: RequestController,
    shared: Arc<SharedWorking>,
}

impl StreamController {
    pub fn new(controller: RequestController, shared: Arc<SharedWorking>) -> Self {
        Self { controller, shared }
    }

    /// Asks every node to hold stream data. `state_changed` fires once all nodes have
    /// acknowledged. False when a previous change is still being acknowledged.
    pub fn suspend(&self, state_changed: impl FnOnce() + Send + 'static) -> bool {
        self.set(DesiredState::Suspended, state_changed)
    }

    /// Asks every node to send stream data again.
    pub fn resume(&self, state_changed: impl FnOnce() + Send + 'static) -> bool {
        self.set(DesiredState::Running, state_changed)
    }

    /// Ends the stream on every node.
    pub fn stop(&self, state_changed: impl FnOnce() + Send + 'static) -> bool {
        self.set(DesiredState::Stopped, state_changed)
    }

    pub fn shared(&self) -> &Arc<SharedWorking> {
        &self.shared
    }

    fn set(&self, state: DesiredState, state_changed: impl FnOnce() + Send + 'static) -> bool {
        self.shared.set_desired_state(
            state,
            || {
                self.controller
                    .resume_suspended_handlers(RESUME_CODE_STATE_CHANGE);
            },
            state_changed,
        )
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn state_change_is_gated_on_outstanding_acks() {
        let shared = SharedWorking::new();
        assert_eq!(shared.desired_state(), DesiredState::Running);

        let signaled = shared.begin_ack_wait();
        assert_eq!(signaled, DesiredState::Running);

        // While an ack is outstanding, every change is refused and not queued.
        let mut began = false;
        let accepted =
            shared.set_desired_state(DesiredState::Suspended, || began = true, || {});
        assert!(!accepted);
        assert!(!began);
        assert_eq!(shared.desired_state(), DesiredState::Running);

        assert!(shared.end_ack_wait());
        let accepted =
            shared.set_desired_state(DesiredState::Suspended, || began = true, || {});
        assert!(accepted);
        assert_eq!(shared.desired_state(), DesiredState::Suspended);
        // One instance had initialised... none had, so `begin` must not run.
        assert!(!began);
    }

    #[test]
    fn begin_runs_only_after_some_instance_initialised() {
        let shared = SharedWorking::new();
        let mut began = false;
        let mut changed = false;

        // No node contact yet: the change takes effect immediately.
        assert!(shared.set_desired_state(
            DesiredState::Suspended,
            || began = true,
            || changed = true
        ));
        assert!(!began);
        assert!(changed);

        shared.note_initialised(3);
        let mut changed_again = false;
        assert!(shared.set_desired_state(
            DesiredState::Running,
            || began = true,
            || changed_again = true
        ));
        assert!(began);
        assert!(!changed_again);
    }

    #[test]
    fn first_initialisation_fires_exactly_once() {
        let shared = SharedWorking::new();
        assert!(!shared.note_initialised(3));
        assert!(!shared.note_initialised(3));
        assert!(shared.note_initialised(3));
        // A fourth instance (e.g. a node added later) does not re-fire it.
        assert!(!shared.note_initialised(4));
        assert_eq!(shared.initialised(), 4);
    }
}
