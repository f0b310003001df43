//! Status codes nodes attach to request replies.

use crate::error::{ErrorKind, Result};

/// One-byte status a node reports in reply to a request or a control message.
#[derive(Copy, Clone, Debug, Eq, PartialEq, derive_more::Display)]
#[repr(u8)]
pub enum StatusCode {
    /// The operation succeeded.
    #[display("ok")]
    Ok = 0,

    /// The operation failed node-side.
    #[display("error")]
    Error = 1,

    /// The node does not know this request type.
    #[display("request not supported")]
    RequestNotSupported = 2,

    /// The node knows the request type but not this version of it.
    #[display("version not supported")]
    VersionNotSupported = 3,
}

impl StatusCode {
    /// Attempt to infer the status based on the numeric value.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::Error),
            2 => Ok(StatusCode::RequestNotSupported),
            3 => Ok(StatusCode::VersionNotSupported),
            other => Err(ErrorKind::Protocol {
                message: format!("invalid status code: {}", other),
            }
            .into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, StatusCode::Ok)
    }
}
