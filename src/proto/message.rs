use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{MessageHeader, MessageType},
    MAX_AUTH_BODY_LEN, REQUEST_ID_LEN,
};
use crate::{
    error::{Error, Result},
    request::RequestId,
};

/// One framed wire message: a validated header plus its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Message {
    pub(crate) header: MessageHeader,
    pub(crate) body: Vec<u8>,
}

impl Message {
    /// Builds a request message whose body is the request id followed by `payload`.
    pub(crate) fn request(request_id: RequestId, payload: &[u8]) -> Self {
        let mut body = Vec::with_capacity(REQUEST_ID_LEN + payload.len());
        body.extend_from_slice(&request_id.to_le_bytes());
        body.extend_from_slice(payload);
        Self {
            header: MessageHeader::new(MessageType::Request, body.len() as u64),
            body,
        }
    }

    pub(crate) fn authentication(body: Vec<u8>) -> Result<Self> {
        if body.len() as u64 > MAX_AUTH_BODY_LEN {
            return Err(Error::invalid_argument(format!(
                "authentication body too long: {} bytes",
                body.len()
            )));
        }
        Ok(Self {
            header: MessageHeader::new(MessageType::Authentication, body.len() as u64),
            body,
        })
    }

    /// The request id leading the body. Only meaningful for request messages, whose header
    /// validation guarantees the body is long enough.
    pub(crate) fn request_id(&self) -> RequestId {
        debug_assert_eq!(self.header.message_type, MessageType::Request);
        RequestId::from_le_bytes(self.body[..REQUEST_ID_LEN].try_into().unwrap())
    }

    /// The request body after the leading request id.
    pub(crate) fn payload(&self) -> &[u8] {
        &self.body[REQUEST_ID_LEN..]
    }

    pub(crate) async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let header = MessageHeader::read_from(reader).await?;
        let mut body = vec![0u8; header.body_length as usize];
        reader.read_exact(&mut body).await?;
        Ok(Self { header, body })
    }

    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        self.header.write_to(writer).await?;
        writer.write_all(&self.body).await?;
        writer.flush().await?;
        Ok(())
    }
}
