//! Lazy listings backed by a bounded channel.
//!
//! The producer (a database cursor) starts on first poll and runs on its own
//! task. It stops as soon as the consumer drops the stream, which releases
//! the cursor with it.

use crate::error::Result;
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use tokio::sync::mpsc;

/// Rows buffered ahead of the consumer
pub(crate) const LIST_BUFFER: usize = 64;

enum State<F, T> {
    Idle(F),
    Running(mpsc::Receiver<Result<T>>),
}

fn lazy_receiver<T, F>(start: F) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    F: FnOnce() -> mpsc::Receiver<Result<T>> + Send + 'static,
{
    stream::unfold(State::Idle(start), |state| async move {
        let mut rx = match state {
            State::Idle(start) => start(),
            State::Running(rx) => rx,
        };
        rx.recv().await.map(|item| (item, State::Running(rx)))
    })
    .boxed()
}

/// Stream fed by an async producer task
pub(crate) fn channel_stream<T, F, Fut>(produce: F) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    F: FnOnce(mpsc::Sender<Result<T>>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    lazy_receiver(move || {
        let (tx, rx) = mpsc::channel(LIST_BUFFER);
        tokio::spawn(produce(tx));
        rx
    })
}

/// Stream fed by a producer running on the blocking pool
pub(crate) fn blocking_channel_stream<T, F>(produce: F) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    F: FnOnce(mpsc::Sender<Result<T>>) + Send + 'static,
{
    lazy_receiver(move || {
        let (tx, rx) = mpsc::channel(LIST_BUFFER);
        tokio::task::spawn_blocking(move || produce(tx));
        rx
    })
}
