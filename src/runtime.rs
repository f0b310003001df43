//! Small async runtime helpers used throughout the crate.

pub(crate) mod join_handle;
pub(crate) mod reply;
pub(crate) mod stream;

use std::{future::Future, time::Duration};

pub(crate) use self::{
    join_handle::AsyncJoinHandle,
    reply::{reply_channel, ReplyHandle},
};
use crate::error::{Error, Result};

/// Spawn a task in the background to run a future.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}

/// Await on a future for a maximum amount of time before returning an error.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::network_timeout())
}

/// Pause for the given duration.
pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}
