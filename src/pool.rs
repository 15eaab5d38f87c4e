//! Contains the bounded session pool.

mod background;
pub(crate) mod registry;

use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
        Arc,
        Mutex,
    },
    time::{Duration, Instant},
};

use derive_where::derive_where;
use tokio_util::sync::CancellationToken;

use crate::{
    balancer::{HostConnectionCounts, LoadBalancer},
    error::{Error, Result},
    metrics::PoolMetrics,
    options::{LoadBalancePolicy, PoolSettings, ServerRedirectionMode},
    runtime::AsyncJoinHandle,
    session::{PooledSession, ServerSession, SessionHealth, SessionInner},
};

/// Minimum milliseconds between leak-recovery scans triggered by saturated
/// checkouts.
const LEAK_SCAN_INTERVAL_MILLIS: i64 = 1000;

/// How long `clean_pool` waits for a permit before concluding the pool is
/// saturated and leaving stale sessions to be cleaned at check-in.
const CLEAN_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(10);

/// A bounded pool of server sessions for one set of connection settings.
///
/// All state is kept in an `Arc`; the handle is cheap to clone. Pools are
/// usually obtained from a [`PoolRegistry`](crate::PoolRegistry), which also
/// starts the background maintenance tasks; a pool constructed directly with
/// [`ConnectionPool::new`] only runs them after
/// [`start_background_tasks`](ConnectionPool::start_background_tasks).
#[derive_where(Debug)]
pub struct ConnectionPool<S: ServerSession> {
    inner: Arc<PoolInner<S>>,
}

impl<S: ServerSession> Clone for ConnectionPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive_where(Debug)]
struct PoolInner<S: ServerSession> {
    settings: PoolSettings,

    /// The name metrics and log lines are tagged with.
    name: String,

    /// Incremented on clear; sessions created under an older generation are
    /// disposed the next time the pool sees them.
    generation: AtomicU32,

    /// Sessions available for reuse. Checked out from the front, returned to
    /// the front, reaped from the back, so the front stays hot.
    idle: Mutex<VecDeque<Arc<SessionInner<S>>>>,

    /// Sessions currently checked out, by session id.
    leased: Mutex<HashMap<u32, Arc<SessionInner<S>>>>,

    /// One permit per leased session or in-flight create; waiters queue here
    /// when the pool is saturated.
    checkout_permits: tokio::sync::Semaphore,

    /// Serializes reap and clear so maintenance passes never interleave.
    clean_lock: tokio::sync::Mutex<()>,

    /// Milliseconds since `epoch` of the last leak-recovery scan; negative
    /// before the first scan so a freshly created pool is immediately
    /// eligible.
    last_leak_scan: AtomicI64,

    next_session_id: AtomicU32,

    /// Sessions per host; present only for least-connections balancing and
    /// shared with the balancer.
    host_counts: Option<HostConnectionCounts>,

    #[derive_where(skip)]
    balancer: LoadBalancer,

    #[derive_where(skip)]
    metrics: PoolMetrics,

    /// Lazily created, dropped on clear.
    procedure_cache: Mutex<Option<Arc<Mutex<ProcedureCache>>>>,

    epoch: Instant,

    shutdown: CancellationToken,

    /// Join handles for the reaper and DNS watcher.
    background_tasks: Mutex<Vec<AsyncJoinHandle<()>>>,

    disposed: AtomicBool,
}

impl<S: ServerSession> ConnectionPool<S> {
    /// Creates a pool for the given settings. Fails if the settings do not
    /// validate.
    pub fn new(settings: PoolSettings) -> Result<Self> {
        settings.validate()?;

        let name = settings.display_name();
        let host_counts = matches!(settings.load_balance, LoadBalancePolicy::LeastConnections)
            .then(HostConnectionCounts::default);
        let balancer = LoadBalancer::new(settings.load_balance, host_counts.clone());
        let metrics = PoolMetrics::new(&name);
        metrics.publish_configured_limits(settings.minimum_pool_size, settings.maximum_pool_size);

        let max_permits = usize::try_from(settings.maximum_pool_size).unwrap_or(usize::MAX);

        Ok(Self {
            inner: Arc::new(PoolInner {
                name,
                generation: AtomicU32::new(0),
                idle: Mutex::new(VecDeque::new()),
                leased: Mutex::new(HashMap::new()),
                checkout_permits: tokio::sync::Semaphore::new(max_permits),
                clean_lock: tokio::sync::Mutex::new(()),
                last_leak_scan: AtomicI64::new(-LEAK_SCAN_INTERVAL_MILLIS),
                next_session_id: AtomicU32::new(0),
                host_counts,
                balancer,
                metrics,
                procedure_cache: Mutex::new(None),
                epoch: Instant::now(),
                shutdown: CancellationToken::new(),
                background_tasks: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
                settings,
            }),
        })
    }

    /// The name this pool reports itself under.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The settings this pool was created with.
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Checks a session out of the pool, establishing a new one if no idle
    /// session can be reused.
    ///
    /// `caller` is the logical connection that will hold the session; only a
    /// weak reference is kept, so a caller that becomes unreachable without
    /// checking the session back in is eventually detected and its session
    /// reclaimed. `cancel` bounds the entire checkout, including the wait for
    /// a free slot when the pool is saturated.
    pub async fn check_out<C>(
        &self,
        caller: &Arc<C>,
        cancel: &CancellationToken,
    ) -> Result<PooledSession<S>>
    where
        C: Send + Sync + 'static,
    {
        let start = Instant::now();
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }

        // A saturated pool is the moment leaked sessions actually hurt, so
        // scan before queueing up behind the permits.
        if self.inner.checkout_permits.available_permits() == 0 && self.leak_scan_due() {
            self.recover_leaked_sessions().await;
        }

        if self.inner.settings.minimum_pool_size > 0 {
            self.ensure_minimum_sessions(cancel).await?;
        }

        let permit = tokio::select! {
            biased;
            permit = self.inner.checkout_permits.acquire() => {
                permit.map_err(|_| Error::internal("checkout semaphore closed"))?
            }
            _ = cancel.cancelled() => {
                return Err(Error::pool_exhausted(&self.inner.name));
            }
        };

        match self.checkout_session(caller, start, cancel).await {
            Ok(session) => {
                // The permit now belongs to the leased session; check_in
                // releases it.
                permit.forget();
                Ok(PooledSession::new(session))
            }
            // Dropping the permit releases it.
            Err(error) => Err(error),
        }
    }

    /// The permit-holding half of checkout: pop at most one idle session and
    /// reuse it if it passes the generation and reset checks, otherwise
    /// connect a new one. A discarded session does not send us back to the
    /// idle list; anything still queued there is left for later checkouts
    /// and the reaper.
    async fn checkout_session<C>(
        &self,
        caller: &Arc<C>,
        start: Instant,
        cancel: &CancellationToken,
    ) -> Result<Arc<SessionInner<S>>>
    where
        C: Send + Sync + 'static,
    {
        if let Some(session) = self.pop_idle_front() {
            if session.generation != self.generation() {
                tracing::debug!(
                    pool = %self.inner.name,
                    session = session.id,
                    "discarding stale-generation session",
                );
                self.discard_session(&session).await;
            } else {
                let reusable = {
                    let mut conn = session.conn.lock().await;
                    if self.inner.settings.connection_reset || conn.needs_reset() {
                        matches!(
                            conn.try_reset(&self.inner.settings, cancel).await,
                            Ok(true)
                        )
                    } else {
                        true
                    }
                };
                if reusable {
                    self.lease_session(&session, caller);
                    self.inner.metrics.record_wait_time(start.elapsed());
                    return Ok(session);
                }
                tracing::debug!(
                    pool = %self.inner.name,
                    session = session.id,
                    "discarding session that failed reset",
                );
                self.discard_session(&session).await;
            }
        }

        let connect_started = Instant::now();
        let session = self.connect_session(cancel).await?;
        self.adjust_host_count(&session.host, 1);
        self.lease_session(&session, caller);
        self.inner.metrics.record_create_time(connect_started.elapsed());
        Ok(session)
    }

    fn pop_idle_front(&self) -> Option<Arc<SessionInner<S>>> {
        let session = self.inner.idle.lock().unwrap().pop_front();
        if session.is_some() {
            self.inner.metrics.add_idle(-1);
        }
        session
    }

    fn lease_session<C>(&self, session: &Arc<SessionInner<S>>, caller: &Arc<C>)
    where
        C: Send + Sync + 'static,
    {
        session.set_owner(caller);
        self.inner
            .leased
            .lock()
            .unwrap()
            .insert(session.id, session.clone());
        self.inner.metrics.add_used(1);
    }

    /// Checks a session back into the pool. Healthy sessions become
    /// immediately reusable; anything else is disposed.
    pub async fn check_in(&self, session: PooledSession<S>) {
        self.check_in_session(session.inner).await;
    }

    async fn check_in_session(&self, session: Arc<SessionInner<S>>) {
        let was_leased = self.inner.leased.lock().unwrap().remove(&session.id).is_some();
        if was_leased {
            self.inner.metrics.add_used(-1);
        }
        session.clear_owner();

        let health = {
            let conn = session.conn.lock().await;
            session.health(
                &conn,
                self.generation(),
                self.inner.settings.connection_lifetime,
            )
        };

        if health == SessionHealth::Healthy {
            session.mark_returned();
            self.inner.idle.lock().unwrap().push_front(session);
            self.inner.metrics.add_idle(1);
        } else {
            tracing::debug!(
                pool = %self.inner.name,
                session = session.id,
                ?health,
                "disposing session at check-in",
            );
            self.discard_session(&session).await;
        }

        self.inner.checkout_permits.add_permits(1);
    }

    /// Invalidates every extant session and drops the procedure cache.
    /// Sessions the clean pass cannot reach (checked out, or the pool is
    /// saturated) are disposed when they next come back through the pool.
    pub async fn clear(&self, cancel: &CancellationToken) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.procedure_cache.lock().unwrap() = None;
        tracing::debug!(pool = %self.inner.name, generation, "pool cleared");

        self.recover_leaked_sessions().await;
        self.clean_pool(|session| session.generation != self.generation(), false, cancel)
            .await;
    }

    /// Evicts idle sessions that have outlived the configured idle timeout,
    /// oldest first, never dropping the pool below its minimum size.
    pub async fn reap(&self, cancel: &CancellationToken) {
        self.recover_leaked_sessions().await;

        let idle_timeout = self.inner.settings.connection_idle_timeout;
        if idle_timeout.is_zero() {
            return;
        }
        self.clean_pool(
            |session| session.last_returned_at().elapsed() >= idle_timeout,
            true,
            cancel,
        )
        .await;
    }

    /// Stops the background maintenance tasks and retracts the configured
    /// gauges. Idle sessions are left alone; the process-exit path performs a
    /// final clear through the registry.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.inner.background_tasks.lock().unwrap());
        futures_util::future::join_all(tasks).await;

        self.inner.metrics.retract_configured_limits(
            self.inner.settings.minimum_pool_size,
            self.inner.settings.maximum_pool_size,
        );
    }

    /// Marks a pool that lost a registry creation race as dead, retracting
    /// the gauges it published on construction. Such a pool never started
    /// background tasks and never held sessions.
    pub(crate) fn retire(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.metrics.retract_configured_limits(
            self.inner.settings.minimum_pool_size,
            self.inner.settings.maximum_pool_size,
        );
    }

    /// Adjusts the gauge of callers currently waiting on this pool.
    pub fn add_pending_request_count(&self, delta: i64) {
        self.inner.metrics.add_pending_requests(delta);
    }

    /// The per-pool stored-procedure metadata cache, created on first use.
    pub fn procedure_cache(&self) -> Arc<Mutex<ProcedureCache>> {
        self.inner
            .procedure_cache
            .lock()
            .unwrap()
            .get_or_insert_with(Default::default)
            .clone()
    }

    /// Starts the reaper and DNS watcher appropriate for this pool's
    /// settings. Must be called from within an async runtime. Called by the
    /// registry when it creates a pool.
    pub fn start_background_tasks(&self) {
        background::start(self);
    }

    fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn uptime_millis(&self) -> i64 {
        i64::try_from(self.inner.epoch.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    fn leak_scan_due(&self) -> bool {
        let last = self.inner.last_leak_scan.load(Ordering::SeqCst);
        self.uptime_millis() - last >= LEAK_SCAN_INTERVAL_MILLIS
    }

    /// Returns every leased session whose owning logical connection is no
    /// longer reachable to the pool. Each recovered session is swapped onto a
    /// strong placeholder owner under the lease lock, so a concurrent scan
    /// cannot double-handle it, and checked in outside the lock.
    async fn recover_leaked_sessions(&self) {
        self.inner
            .last_leak_scan
            .store(self.uptime_millis(), Ordering::SeqCst);

        let mut leaked = Vec::new();
        {
            let leased = self.inner.leased.lock().unwrap();
            for session in leased.values() {
                if let Some(placeholder) = session.try_begin_reclaim() {
                    leaked.push((session.clone(), placeholder));
                }
            }
        }

        for (session, placeholder) in leaked {
            tracing::warn!(
                pool = %self.inner.name,
                session = session.id,
                "recovered leaked session",
            );
            self.check_in_session(session).await;
            // The placeholder has to outlive the check-in so a scan that ran
            // concurrently saw a live owner the whole time.
            drop(placeholder);
        }
    }

    /// Lazily pre-fills the pool up to its minimum size. Exits early if the
    /// pool is saturated.
    async fn ensure_minimum_sessions(&self, cancel: &CancellationToken) -> Result<()> {
        let minimum = usize::try_from(self.inner.settings.minimum_pool_size).unwrap_or(usize::MAX);
        loop {
            if self.extant_session_count() >= minimum {
                return Ok(());
            }
            let permit = match self.inner.checkout_permits.try_acquire() {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };

            let session = self.connect_session(cancel).await?;
            self.adjust_host_count(&session.host, 1);
            self.inner.idle.lock().unwrap().push_front(session);
            self.inner.metrics.add_idle(1);
            drop(permit);
        }
    }

    /// Extant sessions: leased plus in-flight creations (permits out) plus
    /// idle.
    fn extant_session_count(&self) -> usize {
        let max = usize::try_from(self.inner.settings.maximum_pool_size).unwrap_or(usize::MAX);
        let out = max.saturating_sub(self.inner.checkout_permits.available_permits());
        out + self.inner.idle.lock().unwrap().len()
    }

    /// Removes sessions matching `should_clean` from the back of the idle
    /// list (least recently returned first), stopping at the first session
    /// that does not match. Serialized against other maintenance passes.
    async fn clean_pool(
        &self,
        should_clean: impl Fn(&SessionInner<S>) -> bool,
        respect_minimum: bool,
        cancel: &CancellationToken,
    ) {
        let _maintenance = self.inner.clean_lock.lock().await;
        let minimum = usize::try_from(self.inner.settings.minimum_pool_size).unwrap_or(usize::MAX);

        loop {
            if cancel.is_cancelled() {
                return;
            }
            if respect_minimum && self.extant_session_count() <= minimum {
                return;
            }

            // A permit guards the dispose below against a concurrent
            // checkout racing past the maximum. If none frees up quickly the
            // pool is saturated and stale sessions will be cleaned at
            // check-in instead.
            let permit = match crate::runtime::timeout(
                CLEAN_ACQUIRE_TIMEOUT,
                self.inner.checkout_permits.acquire(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                _ => return,
            };

            let session = self.inner.idle.lock().unwrap().pop_back();
            let Some(session) = session else {
                drop(permit);
                return;
            };
            self.inner.metrics.add_idle(-1);

            if should_clean(&session) {
                self.discard_session(&session).await;
                drop(permit);
                continue;
            }

            // The back of the list is the oldest session; everything in
            // front of it is newer and will not match either.
            self.inner.idle.lock().unwrap().push_back(session);
            self.inner.metrics.add_idle(1);
            drop(permit);
            return;
        }
    }

    /// Establishes a new session, following a server redirect when the
    /// settings allow it.
    async fn connect_session(&self, cancel: &CancellationToken) -> Result<Arc<SessionInner<S>>> {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation();
        let settings = &self.inner.settings;

        let (mut conn, status) = S::establish(settings, &self.inner.balancer, cancel).await?;

        let mode = settings.server_redirection_mode;
        if mode != ServerRedirectionMode::Disabled {
            let target = status.as_deref().and_then(RedirectTarget::parse);
            let mut redirected = false;
            let mut redirect_failure = None;

            match target {
                Some(target) if target.matches_endpoint(settings) => {
                    // Already connected to the advertised endpoint.
                    redirected = true;
                }
                Some(target) => {
                    let redirected_settings =
                        settings.redirected_to(&target.host, target.port, &target.user);
                    match S::establish(&redirected_settings, &self.inner.balancer, cancel).await {
                        Ok((redirected_conn, _)) => {
                            tracing::debug!(
                                pool = %self.inner.name,
                                host = %target.host,
                                "following server redirection",
                            );
                            conn.dispose().await;
                            conn = redirected_conn;
                            redirected = true;
                        }
                        Err(error) => {
                            tracing::debug!(
                                pool = %self.inner.name,
                                host = %target.host,
                                %error,
                                "server redirection failed",
                            );
                            redirect_failure = Some(error);
                        }
                    }
                }
                None => {}
            }

            if mode == ServerRedirectionMode::Required && !redirected {
                conn.dispose().await;
                return Err(Error::redirection_required(redirect_failure));
            }
        }

        Ok(Arc::new(SessionInner::new(id, generation, conn)))
    }

    /// Removes a session from this pool's accounting and closes it,
    /// best-effort.
    async fn discard_session(&self, session: &Arc<SessionInner<S>>) {
        self.adjust_host_count(&session.host, -1);
        let mut conn = session.conn.lock().await;
        conn.dispose().await;
    }

    fn adjust_host_count(&self, host: &str, delta: i32) {
        if let Some(ref counts) = self.inner.host_counts {
            let mut counts = counts.lock().unwrap();
            let count = counts.entry(host.to_string()).or_insert(0);
            *count = count.saturating_add_signed(delta);
            if *count == 0 {
                counts.remove(host);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn leased_count(&self) -> usize {
        self.inner.leased.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn available_permits(&self) -> usize {
        self.inner.checkout_permits.available_permits()
    }

    #[cfg(test)]
    pub(crate) fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A parsed `Location: mysql://...` redirect header from a connect status
/// string.
#[derive(Debug, PartialEq, Eq)]
struct RedirectTarget {
    host: String,
    port: u16,
    user: String,
    #[allow(dead_code)]
    ttl: Option<u64>,
}

impl RedirectTarget {
    /// Parses `Location: mysql://host:port/user=<user>&ttl=<seconds>`.
    /// Anything else yields `None`.
    fn parse(status: &str) -> Option<Self> {
        let rest = status.strip_prefix("Location: mysql://")?;
        let (endpoint, params) = rest.split_once('/')?;
        let (host, port) = endpoint.rsplit_once(':')?;
        let port = port.parse().ok()?;

        let mut user = None;
        let mut ttl = None;
        for pair in params.trim().split('&') {
            match pair.split_once('=') {
                Some(("user", value)) => user = Some(value.to_string()),
                Some(("ttl", value)) => ttl = value.parse().ok(),
                _ => {}
            }
        }

        Some(Self {
            host: host.to_string(),
            port,
            user: user?,
            ttl,
        })
    }

    /// Whether this target is the endpoint the pool is already configured
    /// for. Only the first host of a multi-host configuration is compared.
    fn matches_endpoint(&self, settings: &PoolSettings) -> bool {
        settings.hosts.first().is_some_and(|host| host == &self.host)
            && settings.port == self.port
            && settings.user == self.user
    }
}

/// Opaque per-pool cache of stored-procedure metadata, keyed by the
/// procedure's qualified name. The pool only manages its lifetime: the cache
/// is created on first access and dropped when the pool is cleared; callers
/// lock it for everything else.
#[derive(Default)]
pub struct ProcedureCache {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ProcedureCache {
    /// Looks up cached metadata for a procedure.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.entries.get(name).cloned()
    }

    /// Caches metadata for a procedure, replacing any previous entry.
    pub fn insert(&mut self, name: impl Into<String>, metadata: Arc<dyn Any + Send + Sync>) {
        self.entries.insert(name.into(), metadata);
    }

    /// The number of cached procedures.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ProcedureCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureCache")
            .field("len", &self.entries.len())
            .finish()
    }
}
