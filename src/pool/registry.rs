//! Contains the process-wide mapping from connection strings to pools.

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{Arc, Mutex},
};

use derive_where::derive_where;
use tokio_util::sync::CancellationToken;

use super::ConnectionPool;
use crate::{
    error::Result,
    options::ConnectionString,
    session::ServerSession,
};

/// Maps connection strings to pools.
///
/// Entries are created lazily on first use and never removed, only cleared;
/// one pool may be reachable under several raw connection strings that share
/// a canonical form. The registry is an ordinary value rather than a global:
/// embedders that want process-wide pooling keep one in a `static`, and
/// tests construct their own.
#[derive_where(Debug, Default)]
pub struct PoolRegistry<S: ServerSession> {
    inner: Arc<RegistryInner<S>>,
}

impl<S: ServerSession> Clone for PoolRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive_where(Debug, Default)]
struct RegistryInner<S: ServerSession> {
    /// `None` entries are a negative cache for strings with pooling
    /// disabled.
    pools: Mutex<HashMap<String, Option<ConnectionPool<S>>>>,

    /// Single-slot cache for the most recently used connection string.
    most_recent: Mutex<Option<(String, Option<ConnectionPool<S>>)>>,
}

impl<S: ServerSession> PoolRegistry<S> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the pool for the given connection string, creating it (and
    /// starting its background tasks) if needed. Returns `Ok(None)` when the
    /// string disables pooling, or when it names no existing pool and
    /// `create_if_missing` is false.
    ///
    /// Must be called from within an async runtime when a pool may be
    /// created, since new pools spawn background tasks.
    pub fn get_or_create(
        &self,
        connection_string: &str,
        create_if_missing: bool,
    ) -> Result<Option<ConnectionPool<S>>> {
        if let Some((ref cached_string, ref pool)) = *self.inner.most_recent.lock().unwrap() {
            if cached_string == connection_string {
                return Ok(pool.clone());
            }
        }

        if let Some(entry) = self.inner.pools.lock().unwrap().get(connection_string) {
            let pool = entry.clone();
            self.cache_most_recent(connection_string, pool.clone());
            return Ok(pool);
        }

        let parsed = ConnectionString::parse(connection_string)?;
        if !parsed.settings().pooling {
            self.inner
                .pools
                .lock()
                .unwrap()
                .insert(connection_string.to_string(), None);
            self.cache_most_recent(connection_string, None);
            return Ok(None);
        }

        let normalized = parsed.normalized();
        if normalized != connection_string {
            let aliased = {
                let mut pools = self.inner.pools.lock().unwrap();
                let aliased = pools.get(&normalized).cloned();
                if let Some(ref pool) = aliased {
                    pools
                        .entry(connection_string.to_string())
                        .or_insert_with(|| pool.clone());
                }
                aliased
            };
            if let Some(pool) = aliased {
                self.cache_most_recent(connection_string, pool.clone());
                return Ok(pool);
            }
        }

        if !create_if_missing {
            return Ok(None);
        }

        // Construct outside the map lock; if another caller raced us to the
        // canonical key, their pool wins and ours is discarded.
        let new_pool = ConnectionPool::new(parsed.into_settings())?;
        let (pool, won_race) = {
            let mut pools = self.inner.pools.lock().unwrap();
            match pools.entry(normalized.clone()) {
                Entry::Occupied(existing) => (existing.get().clone(), false),
                Entry::Vacant(slot) => {
                    slot.insert(Some(new_pool.clone()));
                    (Some(new_pool.clone()), true)
                }
            }
        };

        if won_race {
            if normalized != connection_string {
                self.inner
                    .pools
                    .lock()
                    .unwrap()
                    .entry(connection_string.to_string())
                    .or_insert_with(|| pool.clone());
            }
            new_pool.start_background_tasks();
        } else {
            tracing::debug!(
                pool = %new_pool.name(),
                "discarding pool that lost a creation race; unused",
            );
            new_pool.retire();
        }

        self.cache_most_recent(connection_string, pool.clone());
        Ok(pool)
    }

    /// Clears every pool known to this registry. Pools stored under several
    /// keys are cleared once.
    pub async fn clear_all(&self, cancel: &CancellationToken) {
        for pool in self.unique_pools() {
            pool.clear(cancel).await;
        }
    }

    /// Clears and disposes every pool. Intended for graceful shutdown before
    /// the process exits.
    pub async fn shutdown(&self) {
        let cancel = CancellationToken::new();
        let pools = self.unique_pools();
        for pool in &pools {
            pool.clear(&cancel).await;
        }
        for pool in &pools {
            pool.dispose().await;
        }
    }

    /// Returns a guard that clears every known pool when dropped, for wiring
    /// into a process-exit path. Errors during the final clear are swallowed.
    pub fn shutdown_hook(&self) -> ShutdownHook<S> {
        ShutdownHook {
            registry: self.clone(),
        }
    }

    fn unique_pools(&self) -> Vec<ConnectionPool<S>> {
        let pools = self.inner.pools.lock().unwrap();
        let mut unique: Vec<ConnectionPool<S>> = Vec::new();
        for pool in pools.values().flatten() {
            if !unique.iter().any(|seen| Arc::ptr_eq(&seen.inner, &pool.inner)) {
                unique.push(pool.clone());
            }
        }
        unique
    }

    fn cache_most_recent(&self, connection_string: &str, pool: Option<ConnectionPool<S>>) {
        *self.inner.most_recent.lock().unwrap() = Some((connection_string.to_string(), pool));
    }
}

/// Clears every pool known to a registry when dropped.
///
/// The final clear runs on its own thread with a private current-thread
/// runtime, so the hook is safe to drop from synchronous and asynchronous
/// contexts alike; failures are logged and swallowed.
#[derive_where(Debug)]
pub struct ShutdownHook<S: ServerSession> {
    registry: PoolRegistry<S>,
}

impl<S: ServerSession> Drop for ShutdownHook<S> {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let clear = std::thread::Builder::new()
            .name("mysql-pool-shutdown".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(registry.clear_all(&CancellationToken::new()));
                Ok::<_, std::io::Error>(())
            });

        match clear.map(|handle| handle.join()) {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(error))) => {
                tracing::warn!(%error, "shutdown clear failed");
            }
            Ok(Err(_)) => {
                tracing::warn!("shutdown clear panicked");
            }
            Err(error) => {
                tracing::warn!(%error, "could not spawn shutdown thread");
            }
        }
    }
}
