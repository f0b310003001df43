//! Connection establishment: TCP connect plus the authenticated handshake.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::net::TcpStream;

use crate::{
    addr::NodeAddr,
    credentials::CredentialStore,
    error::{Error, Result},
    options::ConnectionOptions,
    proto::{Message, MessageType, StatusCode},
    runtime,
};

const NONCE_LEN: usize = 16;
const MAC_LEN: usize = 32;

/// Contains the logic to establish a connection: opening the socket and authenticating on it
/// before any request traffic is allowed.
#[derive(Clone, Debug)]
pub(super) struct Establisher {
    credentials: Arc<CredentialStore>,
    options: ConnectionOptions,
}

impl Establisher {
    pub(super) fn new(credentials: Arc<CredentialStore>, options: ConnectionOptions) -> Self {
        Self {
            credentials,
            options,
        }
    }

    /// Connects to `address` and completes the handshake, returning a socket ready for
    /// request traffic.
    pub(super) async fn establish(&self, address: &NodeAddr) -> Result<TcpStream> {
        let mut stream = runtime::stream::connect(address, self.options.connect_timeout).await?;
        self.authenticate(&mut stream).await?;
        Ok(stream)
    }

    /// Sends the authentication proof and checks the node's verdict.
    ///
    /// Proof layout: `name_len:u8 | name | timestamp:u64le | nonce:[u8;16] |
    /// hmac_sha256(key, name ‖ timestamp ‖ nonce)`. The credentials in effect at handshake
    /// time are captured here; later credential reloads do not affect this session.
    async fn authenticate(&self, stream: &mut TcpStream) -> Result<()> {
        let name = self.options.auth_name.as_str();
        let credentials = self.credentials.current();
        let key = credentials
            .key(name)
            .ok_or_else(|| Error::authentication(format!("no key for credential {:?}", name)))?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| Error::internal("system clock before epoch"))?
            .as_secs();
        let nonce: [u8; NONCE_LEN] = rand::random();

        let mut mac = Hmac::<Sha256>::new_from_slice(key)
            .map_err(|_| Error::authentication("invalid key length"))?;
        mac.update(name.as_bytes());
        mac.update(&timestamp.to_le_bytes());
        mac.update(&nonce);
        let tag = mac.finalize().into_bytes();

        let mut body = Vec::with_capacity(1 + name.len() + 8 + NONCE_LEN + MAC_LEN);
        body.push(name.len() as u8);
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(&timestamp.to_le_bytes());
        body.extend_from_slice(&nonce);
        body.extend_from_slice(&tag);
        Message::authentication(body)?.write_to(stream).await?;

        let reply = Message::read_from(stream).await?;
        if reply.header.message_type != MessageType::Authentication {
            return Err(Error::protocol(
                "expected authentication reply before request traffic",
            ));
        }
        let verdict = match reply.body.as_slice() {
            [status] => StatusCode::from_u8(*status)?,
            _ => {
                return Err(Error::protocol(format!(
                    "authentication reply must be one status byte, got {}",
                    reply.body.len()
                )))
            }
        };
        if !verdict.is_ok() {
            return Err(Error::authentication(format!(
                "node rejected credentials: {}",
                verdict
            )));
        }
        Ok(())
    }
}
