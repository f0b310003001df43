//! The ordered registry of node connections.

use std::{
    collections::BTreeMap,
    ops::ControlFlow,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use tracing::debug;

use crate::{
    addr::NodeAddr,
    conn::Connection,
    credentials::CredentialStore,
    error::Error,
    notifier::{Notification, Notifier},
    options::{ClientOptions, ConnectionOptions},
    request::registry::RequestRegistry,
};

struct Inner {
    /// Keyed by `cmp_id`, so plain iteration is the deterministic ascending address order.
    connections: BTreeMap<u64, Connection>,
    rng: SmallRng,
    /// Snapshot buffers reused across round-robin iterations.
    scratch: Vec<Vec<Connection>>,
}

/// The set of connections to all registered nodes. At most one connection exists per
/// address.
pub(crate) struct ConnectionSet {
    registry: Arc<RequestRegistry>,
    credentials: Arc<CredentialStore>,
    conn_options: ConnectionOptions,
    notifier: Option<Notifier>,
    inner: Mutex<Inner>,
    /// Connections started but not yet connected for the first time.
    num_initializing: Arc<AtomicUsize>,
}

impl ConnectionSet {
    pub(crate) fn new(
        registry: Arc<RequestRegistry>,
        credentials: Arc<CredentialStore>,
        options: &ClientOptions,
    ) -> Arc<Self> {
        let rng = match options.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        Arc::new(Self {
            registry,
            credentials,
            conn_options: ConnectionOptions::from(options),
            notifier: options.notifier.clone(),
            inner: Mutex::new(Inner {
                connections: BTreeMap::new(),
                rng,
                scratch: Vec::new(),
            }),
            num_initializing: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Starts a connection to `address`. Returns false when one already exists. The new
    /// connection keeps reconnecting in the background until [`stop`](Self::stop).
    pub(crate) fn start(&self, address: NodeAddr) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.connections.contains_key(&address.cmp_id()) {
            return false;
        }
        debug!(address = %address, "starting connection");
        self.num_initializing.fetch_add(1, Ordering::SeqCst);

        let on_startup = {
            let notifier = self.notifier.clone();
            let num_initializing = self.num_initializing.clone();
            let mut connected_before = false;
            Box::new(move |addr: &NodeAddr, error: Option<&Error>| match error {
                None => {
                    if !connected_before {
                        connected_before = true;
                        num_initializing.fetch_sub(1, Ordering::SeqCst);
                    }
                    if let Some(notify) = &notifier {
                        notify(Notification::Connected { address: *addr });
                    }
                }
                Some(error) => {
                    if let Some(notify) = &notifier {
                        notify(Notification::ErrorWhileConnecting {
                            address: *addr,
                            error: error.clone(),
                        });
                    }
                }
            }) as crate::conn::StartupCallback
        };
        let on_disconnect = {
            let notifier = self.notifier.clone();
            Box::new(move |addr: &NodeAddr, error: &Error| {
                if let Some(notify) = &notifier {
                    notify(Notification::Disconnected {
                        address: *addr,
                        error: error.clone(),
                    });
                }
            }) as crate::conn::DisconnectCallback
        };

        let conn = Connection::start(
            address,
            self.registry.clone(),
            self.credentials.clone(),
            self.conn_options.clone(),
            on_startup,
            on_disconnect,
        );
        inner.connections.insert(conn.cmp_id(), conn.clone());
        drop(inner);

        // Extend live all-nodes requests onto the new node.
        crate::request::set::extend_all_nodes_requests(&self.registry, &conn);
        true
    }

    /// Shuts the connection to `address` down and removes it. Returns whether it existed.
    pub(crate) async fn stop(&self, address: &NodeAddr) -> bool {
        let conn = {
            let mut inner = self.inner.lock().unwrap();
            inner.connections.remove(&address.cmp_id())
        };
        match conn {
            Some(conn) => {
                conn.shutdown_and_halt().await;
                true
            }
            None => false,
        }
    }

    /// Stops every connection, in ascending address order.
    pub(crate) async fn stop_all(&self) {
        let conns: Vec<Connection> = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.connections).into_values().collect()
        };
        for conn in conns {
            conn.shutdown_and_halt().await;
        }
    }

    pub(crate) fn get(&self, address: &NodeAddr) -> Option<Connection> {
        let inner = self.inner.lock().unwrap();
        inner.connections.get(&address.cmp_id()).cloned()
    }

    /// Snapshot of every connection in ascending `cmp_id` order.
    pub(crate) fn connections(&self) -> Vec<Connection> {
        let inner = self.inner.lock().unwrap();
        inner.connections.values().cloned().collect()
    }

    /// Snapshot of every connection in descending `cmp_id` order.
    pub(crate) fn connections_descending(&self) -> Vec<Connection> {
        let inner = self.inner.lock().unwrap();
        inner.connections.values().rev().cloned().collect()
    }

    /// A uniformly shuffled snapshot of every connection. Used by round-robin handlers; the
    /// shuffled start avoids biasing load toward the successor of a down node.
    pub(crate) fn shuffled_snapshot(&self) -> Vec<Connection> {
        let mut inner = self.inner.lock().unwrap();
        let mut snapshot: Vec<Connection> = inner.connections.values().cloned().collect();
        snapshot.shuffle(&mut inner.rng);
        snapshot
    }

    /// Visits every currently connected connection exactly once in uniformly shuffled
    /// order. `visit` breaking with a code aborts the iteration and returns that code.
    pub(crate) fn iterate_round_robin(
        &self,
        mut visit: impl FnMut(&Connection) -> ControlFlow<i32>,
    ) -> Option<i32> {
        let mut snapshot = {
            let mut inner = self.inner.lock().unwrap();
            let mut buf = inner.scratch.pop().unwrap_or_default();
            buf.clear();
            buf.extend(inner.connections.values().cloned());
            buf.shuffle(&mut inner.rng);
            buf
        };

        let mut code = None;
        for conn in snapshot.iter().filter(|conn| conn.is_connected()) {
            if let ControlFlow::Break(value) = visit(conn) {
                code = Some(value);
                break;
            }
        }

        snapshot.clear();
        self.inner.lock().unwrap().scratch.push(snapshot);
        code
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    /// Connections started whose first connect has not succeeded yet.
    pub(crate) fn num_initializing(&self) -> usize {
        self.num_initializing.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{credentials::Credentials, stats::RequestStats};

    fn test_set(seed: u64) -> Arc<ConnectionSet> {
        let options = ClientOptions::builder().rng_seed(seed).build();
        let registry = RequestRegistry::new(options.max_requests, Arc::new(RequestStats::new()));
        let credentials = Arc::new(CredentialStore::new(Credentials::new()));
        ConnectionSet::new(registry, credentials, &options)
    }

    fn addr(last: u8, port: u16) -> NodeAddr {
        NodeAddr::new(std::net::Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[tokio::test]
    async fn at_most_one_connection_per_address() {
        let set = test_set(7);
        assert!(set.start(addr(1, 9000)));
        assert!(!set.start(addr(1, 9000)));
        assert_eq!(set.len(), 1);
        assert!(set.stop(&addr(1, 9000)).await);
        assert!(!set.stop(&addr(1, 9000)).await);
        assert_eq!(set.len(), 0);
    }

    #[tokio::test]
    async fn ordered_iteration_is_deterministic() {
        let set = test_set(7);
        set.start(addr(3, 1));
        set.start(addr(1, 2));
        set.start(addr(1, 1));
        set.start(addr(2, 1));

        let ascending: Vec<NodeAddr> = set
            .connections()
            .iter()
            .map(Connection::address)
            .collect();
        assert_eq!(
            ascending,
            vec![addr(1, 1), addr(1, 2), addr(2, 1), addr(3, 1)]
        );

        let descending: Vec<NodeAddr> = set
            .connections_descending()
            .iter()
            .map(Connection::address)
            .collect();
        assert_eq!(
            descending,
            vec![addr(3, 1), addr(2, 1), addr(1, 2), addr(1, 1)]
        );
        set.stop_all().await;
    }

    #[tokio::test]
    async fn round_robin_skips_disconnected() {
        // Nothing is listening on these addresses, so no connection ever reaches the
        // connected state and the iteration must visit nothing.
        let set = test_set(7);
        set.start(addr(1, 1));
        set.start(addr(2, 1));
        let mut visited = 0;
        let code = set.iterate_round_robin(|_| {
            visited += 1;
            ControlFlow::Continue(())
        });
        assert_eq!(code, None);
        assert_eq!(visited, 0);
        set.stop_all().await;
    }

    #[tokio::test]
    async fn shuffle_is_deterministic_under_a_fixed_seed() {
        let orders: Vec<Vec<u64>> = (0..2)
            .map(|_| {
                let set = test_set(42);
                set.start(addr(1, 1));
                set.start(addr(2, 1));
                set.start(addr(3, 1));
                set.start(addr(4, 1));
                set.shuffled_snapshot()
                    .iter()
                    .map(Connection::cmp_id)
                    .collect()
            })
            .collect();
        assert_eq!(orders[0], orders[1]);
    }

    #[tokio::test]
    async fn shuffle_start_is_roughly_uniform() {
        let set = test_set(1234);
        for i in 1..=4u8 {
            set.start(addr(i, 1));
        }
        let mut first_counts: HashMap<u64, u32> = HashMap::new();
        let rounds = 4000;
        for _ in 0..rounds {
            let snapshot = set.shuffled_snapshot();
            *first_counts.entry(snapshot[0].cmp_id()).or_default() += 1;
        }
        // Every connection should lead the shuffled order with frequency near 1/4.
        for (_, count) in first_counts {
            let share = count as f64 / rounds as f64;
            assert!((share - 0.25).abs() < 0.025, "skewed share: {}", share);
        }
    }
}
