use derive_where::derive_where;
use tokio_util::sync::CancellationToken;

use super::{pool::ConnectionPool, TOKIO_RUNTIME};
use crate::{
    error::Result,
    pool::registry::ShutdownHook,
    session::ServerSession,
    PoolRegistry as AsyncPoolRegistry,
};

/// Blocking wrapper around [`PoolRegistry`](crate::PoolRegistry).
#[derive_where(Debug, Default)]
pub struct PoolRegistry<S: ServerSession> {
    async_registry: AsyncPoolRegistry<S>,
}

impl<S: ServerSession> Clone for PoolRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            async_registry: self.async_registry.clone(),
        }
    }
}

impl<S: ServerSession> PoolRegistry<S> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the pool for the given connection string, creating it if
    /// needed. New pools run their background tasks on the wrapper's
    /// dedicated runtime.
    pub fn get_or_create(
        &self,
        connection_string: &str,
        create_if_missing: bool,
    ) -> Result<Option<ConnectionPool<S>>> {
        let _runtime = TOKIO_RUNTIME.enter();
        Ok(self
            .async_registry
            .get_or_create(connection_string, create_if_missing)?
            .map(ConnectionPool::from))
    }

    /// Clears every pool known to this registry.
    pub fn clear_all(&self, cancel: &CancellationToken) {
        TOKIO_RUNTIME.block_on(self.async_registry.clear_all(cancel))
    }

    /// Clears and disposes every pool.
    pub fn shutdown(&self) {
        TOKIO_RUNTIME.block_on(self.async_registry.shutdown())
    }

    /// Returns a guard that clears every known pool when dropped.
    pub fn shutdown_hook(&self) -> ShutdownHook<S> {
        self.async_registry.shutdown_hook()
    }
}
