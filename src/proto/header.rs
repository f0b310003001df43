use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{MAX_AUTH_BODY_LEN, REQUEST_ID_LEN};
use crate::error::{ErrorKind, Result};

/// The wire protocol message types.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum MessageType {
    Request = 1,
    Authentication = 2,
}

impl MessageType {
    /// Attempt to infer the message type based on the numeric value. 0 is the explicit
    /// "invalid" marker and is rejected like any unknown value.
    pub(crate) fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Authentication),
            other => Err(ErrorKind::Protocol {
                message: format!("invalid message type: {}", other),
            }
            .into()),
        }
    }
}

/// The header for any wire protocol message.
///
/// Packed layout: 1-byte type, 8-byte little-endian body length, 1-byte parity chosen so the
/// XOR of all ten header bytes is zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MessageHeader {
    pub(crate) message_type: MessageType,
    pub(crate) body_length: u64,
}

impl MessageHeader {
    pub(crate) const LENGTH: usize = 10;

    pub(crate) fn new(message_type: MessageType, body_length: u64) -> Self {
        Self {
            message_type,
            body_length,
        }
    }

    /// Checks the per-type body length bounds: request bodies must at least carry the request
    /// id, authentication bodies are capped.
    pub(crate) fn validate(&self) -> Result<()> {
        match self.message_type {
            MessageType::Request if self.body_length < REQUEST_ID_LEN as u64 => {
                Err(ErrorKind::Protocol {
                    message: format!("request body too short: {} bytes", self.body_length),
                }
                .into())
            }
            MessageType::Authentication if self.body_length > MAX_AUTH_BODY_LEN => {
                Err(ErrorKind::Protocol {
                    message: format!("authentication body too long: {} bytes", self.body_length),
                }
                .into())
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let mut bytes = [0u8; Self::LENGTH];
        bytes[0] = self.message_type as u8;
        bytes[1..9].copy_from_slice(&self.body_length.to_le_bytes());
        bytes[9] = xor_bytes(&bytes[..9]);
        bytes
    }

    /// Decodes and fully validates a header: parity first, then type, then body bounds.
    pub(crate) fn from_bytes(bytes: [u8; Self::LENGTH]) -> Result<Self> {
        if xor_bytes(&bytes) != 0 {
            return Err(ErrorKind::Protocol {
                message: "header parity mismatch".to_string(),
            }
            .into());
        }
        let message_type = MessageType::from_u8(bytes[0])?;
        let body_length = u64::from_le_bytes(bytes[1..9].try_into().unwrap());
        let header = Self {
            message_type,
            body_length,
        };
        header.validate()?;
        Ok(header)
    }

    pub(crate) async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; Self::LENGTH];
        reader.read_exact(&mut bytes).await?;
        Self::from_bytes(bytes)
    }

    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()).await?;
        Ok(())
    }
}

fn xor_bytes(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}
