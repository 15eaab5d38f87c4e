use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// A handle to a spawned background task. Awaiting the handle yields the
/// task's output; a panicked task propagates its panic to the awaiter.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T> AsyncJoinHandle<T> {
    #[track_caller]
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        AsyncJoinHandle(tokio::task::spawn(fut))
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| match result {
            Ok(output) => output,
            Err(e) if e.is_cancelled() => {
                panic!("attempted to join an aborted task")
            }
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        })
    }
}
