use std::sync::Arc;

use derive_where::derive_where;
use tokio_util::sync::CancellationToken;

use super::TOKIO_RUNTIME;
use crate::{
    error::Result,
    session::{PooledSession, ServerSession},
    ConnectionPool as AsyncConnectionPool,
};

/// Blocking wrapper around [`ConnectionPool`](crate::ConnectionPool).
#[derive_where(Debug)]
pub struct ConnectionPool<S: ServerSession> {
    async_pool: AsyncConnectionPool<S>,
}

impl<S: ServerSession> Clone for ConnectionPool<S> {
    fn clone(&self) -> Self {
        Self {
            async_pool: self.async_pool.clone(),
        }
    }
}

impl<S: ServerSession> From<AsyncConnectionPool<S>> for ConnectionPool<S> {
    fn from(async_pool: AsyncConnectionPool<S>) -> Self {
        Self { async_pool }
    }
}

impl<S: ServerSession> ConnectionPool<S> {
    /// The name this pool reports itself under.
    pub fn name(&self) -> &str {
        self.async_pool.name()
    }

    /// Checks a session out of the pool, blocking the calling thread until
    /// one is available or `cancel` fires.
    pub fn check_out<C>(
        &self,
        caller: &Arc<C>,
        cancel: &CancellationToken,
    ) -> Result<PooledSession<S>>
    where
        C: Send + Sync + 'static,
    {
        TOKIO_RUNTIME.block_on(self.async_pool.check_out(caller, cancel))
    }

    /// Checks a session back into the pool.
    pub fn check_in(&self, session: PooledSession<S>) {
        TOKIO_RUNTIME.block_on(self.async_pool.check_in(session))
    }

    /// Invalidates every extant session.
    pub fn clear(&self, cancel: &CancellationToken) {
        TOKIO_RUNTIME.block_on(self.async_pool.clear(cancel))
    }

    /// Evicts idle sessions that have outlived the configured idle timeout.
    pub fn reap(&self, cancel: &CancellationToken) {
        TOKIO_RUNTIME.block_on(self.async_pool.reap(cancel))
    }

    /// Stops the background maintenance tasks.
    pub fn dispose(&self) {
        TOKIO_RUNTIME.block_on(self.async_pool.dispose())
    }

    /// The async pool this wrapper delegates to.
    pub fn async_pool(&self) -> &AsyncConnectionPool<S> {
        &self.async_pool
    }
}
