//! Options for constructing a [`Client`](crate::Client).

use std::time::Duration;

use derive_where::derive_where;
use typed_builder::TypedBuilder;

use crate::{credentials::Credentials, notifier::Notifier, request::MAX_REQUESTS};

/// Top-level configuration of a client.
#[derive(Clone, TypedBuilder)]
#[derive_where(Debug)]
#[non_exhaustive]
pub struct ClientOptions {
    /// Maximum time to wait for a TCP connect before treating the attempt as failed.
    /// Defaults to 10 seconds; zero disables the limit.
    #[builder(default, setter(strip_option))]
    pub connect_timeout: Option<Duration>,

    /// The credential name this client authenticates as.
    #[builder(default = String::from("client"))]
    pub auth_name: String,

    /// Initial credentials. May later be swapped via
    /// [`Client::reload_credentials`](crate::Client::reload_credentials).
    #[builder(default)]
    pub credentials: Credentials,

    /// Seed for the round-robin shuffle PRNG. Unset seeds from OS entropy; tests set it for
    /// deterministic iteration order.
    #[builder(default, setter(strip_option))]
    pub rng_seed: Option<u64>,

    /// Cap on concurrently active requests.
    #[builder(default = MAX_REQUESTS)]
    pub max_requests: usize,

    /// Callback receiving connection-scoped [`Notification`](crate::Notification)s.
    #[builder(default, setter(strip_option))]
    #[derive_where(skip)]
    pub notifier: Option<Notifier>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The per-connection slice of the client configuration.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionOptions {
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) auth_name: String,
}

impl From<&ClientOptions> for ConnectionOptions {
    fn from(options: &ClientOptions) -> Self {
        Self {
            connect_timeout: options.connect_timeout,
            auth_name: options.auth_name.clone(),
        }
    }
}
