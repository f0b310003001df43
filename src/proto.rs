//! The framed wire protocol spoken with nodes.
//!
//! Every message on the socket is a fixed 10-byte header followed by `body_length` body
//! bytes. Request bodies lead with the 8-byte request id; authentication bodies are small and
//! only legal before the session is established.

pub(crate) mod header;
pub(crate) mod message;
pub mod status;

pub(crate) use self::{header::MessageType, message::Message};
pub use self::status::StatusCode;

/// Length of the request id that leads every request body.
pub(crate) const REQUEST_ID_LEN: usize = std::mem::size_of::<u64>();

/// Upper bound on authentication bodies.
pub(crate) const MAX_AUTH_BODY_LEN: u64 = 999;
