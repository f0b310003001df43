pub(crate) mod mock_node;
mod scenarios;

use std::sync::Arc;

use crate::{credentials::Credentials, notifier::Notification, options::ClientOptions};

pub(crate) const TEST_AUTH_NAME: &str = "client";

pub(crate) fn test_credentials() -> Credentials {
    let mut credentials = Credentials::new();
    credentials
        .insert(TEST_AUTH_NAME, vec![0x42; 32])
        .unwrap();
    credentials
}

/// Client options wired for tests: fixed PRNG seed, test credentials, and a notifier that
/// forwards connection events into a channel.
pub(crate) fn test_options(
    notifications: tokio::sync::mpsc::UnboundedSender<Notification>,
) -> ClientOptions {
    ClientOptions::builder()
        .credentials(test_credentials())
        .rng_seed(7)
        .notifier(Arc::new(move |notification| {
            let _ = notifications.send(notification);
        }))
        .build()
}
