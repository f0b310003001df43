//! Client runtime for the Hive distributed record store.
//!
//! The crate multiplexes many concurrent requests over one persistent, authenticated TCP
//! connection per cluster node. Each request is driven by a handler task that exchanges
//! length-prefixed frames with one or more nodes through an
//! [`EventDispatcher`](request::EventDispatcher); connections reconnect on their own with
//! capped exponential backoff, and request lifecycle events are reported through
//! [`Notification`]s.
//!
//! ```no_run
//! use hivedb::{Client, ClientOptions, NodeAddr};
//!
//! # async fn example() -> hivedb::error::Result<()> {
//! let client = Client::new(ClientOptions::default());
//! client.add_node(NodeAddr::parse("127.0.0.1", 10_000)?);
//! // client.requests().start_single_node(...);
//! # Ok(())
//! # }
//! ```

pub mod addr;
mod client;
pub(crate) mod conn;
pub(crate) mod conn_set;
pub mod credentials;
pub mod error;
pub(crate) mod id_pool;
pub mod notifier;
pub mod options;
pub mod proto;
pub mod request;
pub(crate) mod runtime;
pub mod stats;

#[cfg(test)]
pub(crate) mod test;

pub use crate::{
    addr::NodeAddr,
    client::Client,
    conn::ConnectionStatus,
    credentials::Credentials,
    error::{AbortReason, Error, ErrorKind, Result, UnsupportedKind},
    notifier::{Notification, Notifier},
    options::ClientOptions,
    proto::StatusCode,
    request::{
        RequestContext, RequestController, RequestId, RequestSet, RequestType, MAX_REQUESTS,
    },
};
