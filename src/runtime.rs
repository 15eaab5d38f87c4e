mod join_handle;
#[cfg(feature = "dns-resolver")]
mod resolver;

use std::{future::Future, time::Duration};

pub(crate) use self::join_handle::AsyncJoinHandle;
#[cfg(feature = "dns-resolver")]
pub(crate) use self::resolver::AsyncResolver;
use crate::error::Result;

/// Spawn a task in the background to run a future.
///
/// This must be called from an async block or function running on a runtime.
#[track_caller]
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
        .map_err(|_| std::io::ErrorKind::TimedOut.into())
}
