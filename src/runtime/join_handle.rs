use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::error::{Error, Result};

/// Wrapper around `tokio::task::JoinHandle` that surfaces panics and cancellation as crate
/// errors instead of a runtime-specific join error.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T> AsyncJoinHandle<T> {
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self(tokio::task::spawn(fut))
    }

    /// Request cancellation of the underlying task.
    pub(crate) fn abort(&self) {
        self.0.abort();
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.map_err(|e| Error::internal(format!("task failed: {}", e))))
    }
}
