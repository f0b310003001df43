use tokio::sync::oneshot;

/// Creates a one-shot reply channel to attach to a control message.
///
/// The handle travels inside the message to whoever processes it; the waiter resolves when
/// the handler replies, or with `None` when the message is dropped unprocessed (for
/// instance because the worker it was addressed to has already exited).
pub(crate) fn reply_channel<R>() -> (ReplyHandle<R>, ReplyWaiter<R>) {
    let (sender, receiver) = oneshot::channel();
    (ReplyHandle { sender }, ReplyWaiter { receiver })
}

/// The responding half of a reply channel; consumed by replying.
#[derive(Debug)]
pub(crate) struct ReplyHandle<R> {
    sender: oneshot::Sender<R>,
}

impl<R> ReplyHandle<R> {
    /// Delivers the reply. A waiter that has already given up is fine to reply to.
    pub(crate) fn reply(self, value: R) {
        let _ = self.sender.send(value);
    }
}

/// The waiting half of a reply channel.
#[derive(Debug)]
pub(crate) struct ReplyWaiter<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> ReplyWaiter<R> {
    /// Waits for the reply. `None` means the message never reached a handler.
    pub(crate) async fn wait(self) -> Option<R> {
        self.receiver.await.ok()
    }
}
