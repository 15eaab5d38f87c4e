//! Contains the blocking API. Only available when the `sync` feature is
//! enabled.
//!
//! Every type here is a thin wrapper around its async counterpart; the
//! wrapped calls run on a dedicated runtime, so blocking callers cannot
//! deadlock a single-threaded scheduler they happen to be running on.

mod pool;
mod registry;

pub use pool::ConnectionPool;
pub use registry::PoolRegistry;

pub(crate) static TOKIO_RUNTIME: std::sync::LazyLock<tokio::runtime::Runtime> =
    std::sync::LazyLock::new(|| match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => panic!(
            "Error occurred when starting the underlying async runtime: {}",
            err
        ),
    });
