//! Notifications delivered to user callbacks over the lifetime of connections and requests.

use std::sync::Arc;

use crate::{
    addr::NodeAddr,
    error::{AbortReason, Error, UnsupportedKind},
    request::RequestId,
};

/// Callback invoked with every [`Notification`]. Cheap to clone; may be called from any task.
pub type Notifier = Arc<dyn Fn(Notification) + Send + Sync>;

/// Everything the client reports back to the user, as one tagged union.
///
/// Connection-scoped variants are delivered through the client-level notifier; request-scoped
/// variants through whichever callback the request was started with.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Notification {
    /// A connection reached the connected state (startup or reconnect).
    Connected { address: NodeAddr },

    /// One connection attempt failed. The connection keeps retrying.
    ErrorWhileConnecting { address: NodeAddr, error: Error },

    /// An established connection dropped.
    Disconnected { address: NodeAddr, error: Error },

    /// The connection a request was using dropped while the request was in flight.
    NodeDisconnected {
        request_id: RequestId,
        address: NodeAddr,
        error: Error,
    },

    /// The node reported an error status for the request.
    NodeError {
        request_id: RequestId,
        address: NodeAddr,
    },

    /// The node declined the request as unsupported.
    Unsupported {
        request_id: RequestId,
        address: NodeAddr,
        kind: UnsupportedKind,
    },

    /// The request ran to completion successfully.
    Succeeded { request_id: RequestId },

    /// The request failed client-side.
    Error {
        request_id: RequestId,
        error: Error,
    },

    /// The request was aborted by the user or by its deadline.
    Aborted {
        request_id: RequestId,
        reason: AbortReason,
    },

    /// A chunk of request data arrived for a streaming request.
    RequestData {
        request_id: RequestId,
        bytes: Vec<u8>,
    },
}

impl Notification {
    /// Debug-printable name of the active variant.
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Connected { .. } => "connected",
            Notification::ErrorWhileConnecting { .. } => "error_while_connecting",
            Notification::Disconnected { .. } => "disconnected",
            Notification::NodeDisconnected { .. } => "node_disconnected",
            Notification::NodeError { .. } => "node_error",
            Notification::Unsupported { .. } => "unsupported",
            Notification::Succeeded { .. } => "succeeded",
            Notification::Error { .. } => "error",
            Notification::Aborted { .. } => "aborted",
            Notification::RequestData { .. } => "request_data",
        }
    }

    /// The request this notification concerns, when request-scoped.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Notification::NodeDisconnected { request_id, .. }
            | Notification::NodeError { request_id, .. }
            | Notification::Unsupported { request_id, .. }
            | Notification::Succeeded { request_id }
            | Notification::Error { request_id, .. }
            | Notification::Aborted { request_id, .. }
            | Notification::RequestData { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}
