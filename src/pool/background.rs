//! Background maintenance: the idle-session reaper and the DNS change
//! watcher. Both run until the pool's shutdown token fires; each tick is
//! bounded by its own child token so a stuck pass cannot starve the next
//! one.

use std::time::Duration;

#[cfg(feature = "dns-resolver")]
use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
};

use tokio_util::sync::CancellationToken;

use super::ConnectionPool;
#[cfg(feature = "dns-resolver")]
use crate::options::Protocol;
use crate::{runtime, session::ServerSession};

const MIN_REAP_FREQUENCY: Duration = Duration::from_secs(1);
const MAX_REAP_FREQUENCY: Duration = Duration::from_secs(60);

/// Spawns the maintenance tasks this pool's settings call for.
pub(super) fn start<S: ServerSession>(pool: &ConnectionPool<S>) {
    let mut tasks = pool.inner.background_tasks.lock().unwrap();

    let idle_timeout = pool.inner.settings.connection_idle_timeout;
    if !idle_timeout.is_zero() {
        let period = (idle_timeout / 2).clamp(MIN_REAP_FREQUENCY, MAX_REAP_FREQUENCY);
        tasks.push(runtime::spawn(reap_loop(
            pool.clone(),
            period,
            pool.inner.shutdown.clone(),
        )));
    }

    #[cfg(feature = "dns-resolver")]
    {
        let dns_interval = pool.inner.settings.dns_check_interval;
        if pool.inner.settings.protocol == Protocol::Tcp && !dns_interval.is_zero() {
            tasks.push(runtime::spawn(dns_watch_loop(
                pool.clone(),
                dns_interval,
                pool.inner.shutdown.clone(),
            )));
        }
    }
}

async fn reap_loop<S: ServerSession>(
    pool: ConnectionPool<S>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        let tick_cancel = shutdown.child_token();
        let reap = pool.reap(&tick_cancel);
        tokio::pin!(reap);
        tokio::select! {
            _ = &mut reap => {}
            _ = tokio::time::sleep(period) => {
                tracing::warn!(pool = %pool.inner.name, "reap pass overran its period");
                tick_cancel.cancel();
                reap.await;
            }
        }
    }
}

#[cfg(feature = "dns-resolver")]
async fn dns_watch_loop<S: ServerSession>(
    pool: ConnectionPool<S>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let resolver = match runtime::AsyncResolver::new(None) {
        Ok(resolver) => resolver,
        Err(error) => {
            tracing::warn!(
                pool = %pool.inner.name,
                %error,
                "could not create DNS resolver; DNS watching disabled",
            );
            return;
        }
    };

    let mut known: HashMap<String, HashSet<IpAddr>> = HashMap::new();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        match runtime::timeout(period, check_hosts(&pool, &resolver, &mut known)).await {
            Ok(true) => {
                tracing::debug!(
                    pool = %pool.inner.name,
                    "DNS change detected; clearing pool",
                );
                pool.clear(&shutdown.child_token()).await;
            }
            Ok(false) => {}
            Err(_) => {
                tracing::warn!(pool = %pool.inner.name, "DNS check overran its period");
            }
        }
    }
}

/// Re-resolves every configured host and records the address sets. Returns
/// whether any host lost a previously known address.
#[cfg(feature = "dns-resolver")]
async fn check_hosts<S: ServerSession>(
    pool: &ConnectionPool<S>,
    resolver: &runtime::AsyncResolver,
    known: &mut HashMap<String, HashSet<IpAddr>>,
) -> bool {
    let mut changed = false;
    for host in &pool.inner.settings.hosts {
        match resolver.ip_lookup(host).await {
            Ok(lookup) => {
                let addresses: HashSet<IpAddr> = lookup.iter().collect();
                if let Some(previous) = known.get(host) {
                    if previous.iter().any(|address| !addresses.contains(address)) {
                        changed = true;
                    }
                }
                known.insert(host.clone(), addresses);
            }
            Err(error) => {
                tracing::warn!(
                    pool = %pool.inner.name,
                    host = %host,
                    %error,
                    "DNS resolution failed",
                );
            }
        }
    }
    changed
}
