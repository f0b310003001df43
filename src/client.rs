//! The user entry point tying nodes, requests and credentials together.

use std::{ops::ControlFlow, path::Path, sync::Arc};

use crate::{
    addr::NodeAddr,
    conn::ConnectionStatus,
    conn_set::ConnectionSet,
    credentials::{CredentialStore, Credentials},
    error::Result,
    options::ClientOptions,
    request::{registry::RequestRegistry, RequestSet},
    stats::RequestStats,
};

/// A client of a Hive cluster.
///
/// Register the cluster's nodes with [`add_node`](Client::add_node), then start requests
/// through [`requests`](Client::requests). Connections reconnect on their own; requests are
/// multiplexed over them.
pub struct Client {
    connections: Arc<ConnectionSet>,
    requests: RequestSet,
    credentials: Arc<CredentialStore>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        let stats = Arc::new(RequestStats::new());
        let registry = RequestRegistry::new(options.max_requests, stats);
        let credentials = Arc::new(CredentialStore::new(options.credentials.clone()));
        let connections = ConnectionSet::new(registry.clone(), credentials.clone(), &options);
        let requests = RequestSet::new(registry, connections.clone());
        Self {
            connections,
            requests,
            credentials,
        }
    }

    /// Registers a node and starts connecting to it. Returns false when the node is
    /// already registered.
    pub fn add_node(&self, address: NodeAddr) -> bool {
        self.connections.start(address)
    }

    /// Disconnects from a node and removes it. In-flight requests bound to it fail with a
    /// disconnect error. Returns whether the node was registered.
    pub async fn remove_node(&self, address: &NodeAddr) -> bool {
        self.connections.stop(address).await
    }

    /// The registered node addresses in ascending address order.
    pub fn node_addresses(&self) -> Vec<NodeAddr> {
        self.connections
            .connections()
            .iter()
            .map(|conn| conn.address())
            .collect()
    }

    /// The registered node addresses in descending address order.
    pub fn node_addresses_descending(&self) -> Vec<NodeAddr> {
        self.connections
            .connections_descending()
            .iter()
            .map(|conn| conn.address())
            .collect()
    }

    /// The connection status of one registered node.
    pub fn node_status(&self, address: &NodeAddr) -> Option<ConnectionStatus> {
        self.connections.get(address).map(|conn| conn.status())
    }

    /// Number of registered nodes whose first connect has not completed yet.
    pub fn num_initializing(&self) -> usize {
        self.connections.num_initializing()
    }

    /// Visits every currently connected node once, in uniformly shuffled order, until
    /// `visit` breaks.
    pub fn iterate_round_robin(
        &self,
        visit: impl FnMut(&NodeAddr) -> ControlFlow<i32>,
    ) -> Option<i32> {
        let mut visit = visit;
        self.connections
            .iterate_round_robin(|conn| visit(&conn.address()))
    }

    /// Starting, controlling and inspecting requests.
    pub fn requests(&self) -> &RequestSet {
        &self.requests
    }

    /// Atomically replaces the credentials used by handshakes from now on. Established
    /// sessions are unaffected.
    pub fn replace_credentials(&self, credentials: Credentials) {
        self.credentials.replace(credentials);
    }

    /// Reloads credentials from a `name:hex_key` file.
    pub fn reload_credentials(&self, path: impl AsRef<Path>) -> Result<()> {
        self.credentials.reload_from(path)
    }

    /// Disconnects from every node. Pending requests fail with a disconnect error.
    pub async fn shutdown(&self) {
        self.connections.stop_all().await;
    }
}
