//! Contains the `Error` and `Result` types that `hivedb` uses.

use std::sync::Arc;

use thiserror::Error;

use crate::addr::NodeAddr;

/// The result type for all methods that can return an error in the `hivedb` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `hivedb` crate. The inner [`ErrorKind`] is boxed to keep the
/// type cheap to move and is wrapped so errors can be cloned when fanned out to several
/// in-flight requests.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Error {
        ErrorKind::Protocol {
            message: message.into(),
        }
        .into()
    }

    /// Creates an authentication error with the provided reason.
    pub(crate) fn authentication(message: impl Into<String>) -> Error {
        ErrorKind::Authentication {
            message: message.into(),
        }
        .into()
    }

    /// Construct a generic network timeout error.
    pub(crate) fn network_timeout() -> Error {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    pub(crate) fn disconnected(address: NodeAddr, cause: &Error) -> Error {
        ErrorKind::Disconnected {
            address,
            message: cause.to_string(),
        }
        .into()
    }

    pub(crate) fn aborted(reason: AbortReason) -> Error {
        ErrorKind::Aborted { reason }.into()
    }

    /// Whether this error was caused by the transport layer rather than by a node-reported
    /// status or by the caller.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::Disconnected { .. }
        )
    }

    pub fn is_protocol_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Protocol { .. })
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::NoMoreRequests)
    }

    /// The abort reason, if this error terminated a request via
    /// [`abort_request`](crate::RequestSet::abort_request) or a request timeout.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self.kind.as_ref() {
            ErrorKind::Aborted { reason } => Some(*reason),
            _ => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(err)).into()
    }
}

impl From<std::io::ErrorKind> for Error {
    fn from(err: std::io::ErrorKind) -> Self {
        ErrorKind::Io(Arc::new(err.into())).into()
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Wrapper around a [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The peer sent bytes that do not form a valid frame, or a frame that is not allowed in
    /// the current phase of the session.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The handshake on a fresh socket failed.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// The node reported an error status for a request.
    #[error("node {address} responded with an error status")]
    Node { address: NodeAddr },

    /// The node does not support the request or the request version.
    #[error("node {address} rejected the request: {kind}")]
    Unsupported {
        address: NodeAddr,
        kind: UnsupportedKind,
    },

    /// The connection a request was exchanging messages on went down.
    #[error("node {address} disconnected: {message}")]
    Disconnected { address: NodeAddr, message: String },

    /// The request was terminated before its handler completed.
    #[error("request aborted: {reason}")]
    Aborted { reason: AbortReason },

    /// The active-request limit was reached; no new request can be started until one
    /// finishes.
    #[error("too many active requests")]
    NoMoreRequests,

    /// The caller passed an argument that the operation cannot accept.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// An internal invariant was violated. These errors indicate a bug in the crate.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Why a request was terminated before its handler ran to completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum AbortReason {
    /// The user aborted the request through its controller.
    #[display("user abort")]
    User,

    /// The per-request deadline armed via
    /// [`set_request_timeout`](crate::RequestSet::set_request_timeout) expired.
    #[display("timeout")]
    Timeout,

    /// The client was shut down while the request was in flight.
    #[display("shutdown")]
    Shutdown,
}

/// The flavor of "not supported" a node reported when it declined a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum UnsupportedKind {
    /// The node does not know the request type at all.
    #[display("request not supported")]
    Request,

    /// The node knows the request type but not the version that was sent.
    #[display("request version not supported")]
    Version,
}
