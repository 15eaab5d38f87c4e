//! Contains the session collaborator trait and the pooled session handle.

use std::{
    any::Any,
    future::Future,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use derive_where::derive_where;
use tokio_util::sync::CancellationToken;

use crate::{balancer::LoadBalancer, error::Result, options::PoolSettings};

/// One authenticated, protocol-ready server session.
///
/// The MySQL wire codec and authentication handshake live behind this trait;
/// the pool only drives the lifecycle. [`establish`](ServerSession::establish)
/// performs its own connect loop over the hosts produced by the
/// [`LoadBalancer`], consulting it once per attempt.
pub trait ServerSession: Send + Sync + Sized + 'static {
    /// Opens a transport to one of the configured hosts, performs the
    /// handshake, and authenticates. Returns the session together with the
    /// server's connect status string, if it sent one (this may carry a
    /// `Location: mysql://...` redirect header).
    fn establish(
        settings: &PoolSettings,
        balancer: &LoadBalancer,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(Self, Option<String>)>> + Send;

    /// Resets protocol state so the session can be reused by a different
    /// logical connection. Returns `Ok(false)` if the session could not be
    /// reset and must be discarded.
    fn try_reset(
        &mut self,
        settings: &PoolSettings,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Closes the session, best-effort.
    fn dispose(&mut self) -> impl Future<Output = ()> + Send;

    /// Whether the underlying transport is still usable.
    fn is_connected(&self) -> bool;

    /// The host this session connected to.
    fn host(&self) -> &str;

    /// Whether session-level state (such as a database override issued by a
    /// `USE` statement) forces a reset on reuse even when the pool is not
    /// configured to always reset.
    fn needs_reset(&self) -> bool {
        false
    }
}

/// The health of a session at check-in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionHealth {
    /// Connected, current generation, within its lifetime.
    Healthy,

    /// The transport is no longer usable.
    NotConnected,

    /// The pool was cleared after this session was created.
    StaleGeneration,

    /// The session exceeded the configured connection lifetime.
    Expired,
}

/// The logical connection currently holding a session, tracked weakly so the
/// pool can observe the owner becoming unreachable without keeping it alive.
pub(crate) enum SessionOwner {
    /// Checked in; no owner.
    None,

    /// Checked out by a live logical connection.
    Leased(Weak<dyn Any + Send + Sync>),

    /// The owner was observed dead and a leak-recovery pass is returning the
    /// session; the strong placeholder keeps a concurrent pass from
    /// double-handling it.
    Reclaiming(Arc<LeakPlaceholder>),
}

/// Placeholder owner installed while a leaked session is being returned.
#[derive(Debug)]
pub(crate) struct LeakPlaceholder;

/// Pool-side record for one session.
#[derive_where(Debug)]
pub(crate) struct SessionInner<S> {
    pub(crate) id: u32,

    /// The pool generation at which this session was created.
    pub(crate) generation: u32,

    /// The host this session connected to, captured at establishment.
    pub(crate) host: String,

    pub(crate) created_at: Instant,

    last_returned_at: Mutex<Instant>,

    #[derive_where(skip)]
    owner: Mutex<SessionOwner>,

    #[derive_where(skip)]
    pub(crate) conn: tokio::sync::Mutex<S>,
}

impl<S: ServerSession> SessionInner<S> {
    pub(crate) fn new(id: u32, generation: u32, conn: S) -> Self {
        let now = Instant::now();
        Self {
            id,
            generation,
            host: conn.host().to_string(),
            created_at: now,
            last_returned_at: Mutex::new(now),
            owner: Mutex::new(SessionOwner::None),
            conn: tokio::sync::Mutex::new(conn),
        }
    }

    pub(crate) fn last_returned_at(&self) -> Instant {
        *self.last_returned_at.lock().unwrap()
    }

    pub(crate) fn mark_returned(&self) {
        *self.last_returned_at.lock().unwrap() = Instant::now();
    }

    pub(crate) fn set_owner<C: Send + Sync + 'static>(&self, caller: &Arc<C>) {
        let caller: Arc<dyn Any + Send + Sync> = caller.clone();
        *self.owner.lock().unwrap() = SessionOwner::Leased(Arc::downgrade(&caller));
    }

    pub(crate) fn clear_owner(&self) {
        *self.owner.lock().unwrap() = SessionOwner::None;
    }

    /// If the owning logical connection is no longer reachable, installs a
    /// strong placeholder owner and returns it; the caller must hold the
    /// placeholder until the session has been checked back in. Returns `None`
    /// for live owners and for sessions already being reclaimed.
    pub(crate) fn try_begin_reclaim(&self) -> Option<Arc<LeakPlaceholder>> {
        let mut owner = self.owner.lock().unwrap();
        let owner_is_gone =
            matches!(*owner, SessionOwner::Leased(ref weak) if weak.upgrade().is_none());
        if owner_is_gone {
            let placeholder = Arc::new(LeakPlaceholder);
            *owner = SessionOwner::Reclaiming(placeholder.clone());
            return Some(placeholder);
        }
        None
    }

    /// Evaluates reusability at check-in time. `conn` is the locked inner
    /// session.
    pub(crate) fn health(
        &self,
        conn: &S,
        current_generation: u32,
        lifetime: Duration,
    ) -> SessionHealth {
        if !conn.is_connected() {
            SessionHealth::NotConnected
        } else if self.generation != current_generation {
            SessionHealth::StaleGeneration
        } else if !lifetime.is_zero() && self.created_at.elapsed() >= lifetime {
            SessionHealth::Expired
        } else {
            SessionHealth::Healthy
        }
    }
}

/// A session checked out of a [`ConnectionPool`](crate::ConnectionPool).
///
/// The handle is returned to the pool with
/// [`ConnectionPool::check_in`](crate::ConnectionPool::check_in); dropping it
/// without checking it in leaks the session until the owning logical
/// connection becomes unreachable and a leak-recovery scan reclaims it.
#[derive_where(Debug)]
pub struct PooledSession<S> {
    pub(crate) inner: Arc<SessionInner<S>>,
}

impl<S: ServerSession> PooledSession<S> {
    pub(crate) fn new(inner: Arc<SessionInner<S>>) -> Self {
        Self { inner }
    }

    /// A pool-unique identifier for this session.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// The host this session is connected to.
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// When this session was established.
    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// Locks the underlying server session for protocol use.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, S> {
        self.inner.conn.lock().await
    }

    /// Locks the underlying server session from blocking code.
    #[cfg(feature = "sync")]
    pub fn blocking_lock(&self) -> tokio::sync::MutexGuard<'_, S> {
        self.inner.conn.blocking_lock()
    }
}
