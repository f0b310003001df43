//! An in-process node speaking the wire protocol over loopback TCP, for scenario tests.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};

use super::test_credentials;
use crate::{
    addr::NodeAddr,
    credentials::Credentials,
    proto::{Message, MessageType, StatusCode},
    request::RequestId,
};

/// What the node does with one inbound request payload.
pub(crate) enum MockReply {
    /// Reply with a request frame carrying these bytes.
    Payload(Vec<u8>),
    /// Write these raw bytes as-is (e.g. a corrupted frame).
    RawBytes(Vec<u8>),
    /// Drop the session.
    Close,
    /// Send nothing.
    Silence,
}

pub(crate) type Behavior =
    Arc<dyn Fn(RequestId, Vec<u8>) -> Vec<MockReply> + Send + Sync>;

pub(crate) struct MockNode {
    address: NodeAddr,
}

impl MockNode {
    /// Binds an ephemeral loopback port and serves sessions with `behavior` until dropped.
    pub(crate) async fn spawn(behavior: Behavior) -> MockNode {
        Self::spawn_on(0, behavior).await
    }

    /// Like [`spawn`](Self::spawn), but on a fixed port.
    pub(crate) async fn spawn_on(port: u16, behavior: Behavior) -> MockNode {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let local = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            other => panic!("unexpected local addr {}", other),
        };
        let credentials = Arc::new(test_credentials());
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let behavior = behavior.clone();
                let credentials = credentials.clone();
                tokio::spawn(async move {
                    let _ = serve_session(stream, behavior, credentials).await;
                });
            }
        });
        MockNode {
            address: NodeAddr::from(local),
        }
    }

    pub(crate) fn address(&self) -> NodeAddr {
        self.address
    }
}

async fn serve_session(
    mut stream: TcpStream,
    behavior: Behavior,
    credentials: Arc<Credentials>,
) -> crate::error::Result<()> {
    handshake(&mut stream, &credentials).await?;
    loop {
        let message = Message::read_from(&mut stream).await?;
        assert_eq!(message.header.message_type, MessageType::Request);
        let id = message.request_id();
        for reply in behavior(id, message.payload().to_vec()) {
            match reply {
                MockReply::Payload(bytes) => {
                    Message::request(id, &bytes).write_to(&mut stream).await?;
                }
                MockReply::RawBytes(raw) => {
                    stream.write_all(&raw).await?;
                    stream.flush().await?;
                }
                MockReply::Close => return Ok(()),
                MockReply::Silence => {}
            }
        }
    }
}

/// Verifies the client's authentication proof and reports the verdict.
async fn handshake(stream: &mut TcpStream, credentials: &Credentials) -> crate::error::Result<()> {
    let message = Message::read_from(stream).await?;
    assert_eq!(message.header.message_type, MessageType::Authentication);

    let verdict = verify_proof(&message.body, credentials);
    Message::authentication(vec![verdict as u8])?
        .write_to(stream)
        .await?;
    assert_eq!(verdict, StatusCode::Ok, "mock node rejected the handshake");
    Ok(())
}

fn verify_proof(body: &[u8], credentials: &Credentials) -> StatusCode {
    let Some((&name_len, rest)) = body.split_first() else {
        return StatusCode::Error;
    };
    let name_len = name_len as usize;
    // name | timestamp(8) | nonce(16) | mac(32)
    if rest.len() != name_len + 8 + 16 + 32 {
        return StatusCode::Error;
    }
    let (name, rest) = rest.split_at(name_len);
    let (timestamp, rest) = rest.split_at(8);
    let (nonce, tag) = rest.split_at(16);

    let Ok(name) = std::str::from_utf8(name) else {
        return StatusCode::Error;
    };
    let Some(key) = credentials.key(name) else {
        return StatusCode::Error;
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(name.as_bytes());
    mac.update(timestamp);
    mac.update(nonce);
    if mac.verify_slice(tag).is_err() {
        return StatusCode::Error;
    }
    StatusCode::Ok
}
