//! Contains the host-selection strategies consulted on each connect attempt.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
};

use rand::seq::SliceRandom;

use crate::options::LoadBalancePolicy;

/// Shared per-host session counts, maintained by the pool and consulted by
/// the least-connections strategy. Guarded by its own mutex; never held
/// across I/O.
pub(crate) type HostConnectionCounts = Arc<Mutex<HashMap<String, u32>>>;

/// Orders candidate host names for connection attempts.
///
/// The connect loop itself lives in
/// [`ServerSession::establish`](crate::ServerSession::establish); the
/// balancer is consulted once per attempt to produce the order in which
/// hosts are tried.
#[derive(Debug)]
pub struct LoadBalancer {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    /// Hosts are tried in their configured order.
    FailOver,

    /// The starting host rotates on each call.
    RoundRobin { cursor: AtomicUsize },

    /// A shuffled copy of the host list.
    Random,

    /// Hosts sorted ascending by their current pooled-session count, ties
    /// broken by configured order.
    LeastConnections { counts: HostConnectionCounts },
}

impl LoadBalancer {
    pub(crate) fn new(policy: LoadBalancePolicy, counts: Option<HostConnectionCounts>) -> Self {
        let inner = match policy {
            LoadBalancePolicy::FailOver => Inner::FailOver,
            LoadBalancePolicy::RoundRobin => Inner::RoundRobin {
                cursor: AtomicUsize::new(0),
            },
            LoadBalancePolicy::Random => Inner::Random,
            LoadBalancePolicy::LeastConnections => Inner::LeastConnections {
                counts: counts.unwrap_or_default(),
            },
        };
        Self { inner }
    }

    /// Produces the host order for one connection attempt.
    pub fn arrange(&self, hosts: &[String]) -> Vec<String> {
        let mut arranged = hosts.to_vec();
        if arranged.len() <= 1 {
            return arranged;
        }

        match self.inner {
            Inner::FailOver => {}
            Inner::RoundRobin { ref cursor } => {
                let offset = cursor.fetch_add(1, Ordering::Relaxed) % arranged.len();
                arranged.rotate_left(offset);
            }
            Inner::Random => {
                arranged.shuffle(&mut rand::rng());
            }
            Inner::LeastConnections { ref counts } => {
                let counts = counts.lock().unwrap();
                arranged.sort_by_key(|host| counts.get(host).copied().unwrap_or(0));
            }
        }

        arranged
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn hosts() -> Vec<String> {
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    }

    #[test]
    fn fail_over_preserves_order() {
        let balancer = LoadBalancer::new(LoadBalancePolicy::FailOver, None);
        assert_eq!(balancer.arrange(&hosts()), hosts());
        assert_eq!(balancer.arrange(&hosts()), hosts());
    }

    #[test]
    fn round_robin_rotates() {
        let balancer = LoadBalancer::new(LoadBalancePolicy::RoundRobin, None);
        assert_eq!(balancer.arrange(&hosts()), vec!["a", "b", "c"]);
        assert_eq!(balancer.arrange(&hosts()), vec!["b", "c", "a"]);
        assert_eq!(balancer.arrange(&hosts()), vec!["c", "a", "b"]);
        assert_eq!(balancer.arrange(&hosts()), vec!["a", "b", "c"]);
    }

    #[test]
    fn random_is_a_permutation() {
        let balancer = LoadBalancer::new(LoadBalancePolicy::Random, None);
        let mut arranged = balancer.arrange(&hosts());
        arranged.sort();
        assert_eq!(arranged, hosts());
    }

    #[test]
    fn least_connections_sorts_by_count_with_stable_ties() {
        let counts: HostConnectionCounts = Default::default();
        counts.lock().unwrap().insert("a".to_string(), 2);
        counts.lock().unwrap().insert("c".to_string(), 1);
        let balancer =
            LoadBalancer::new(LoadBalancePolicy::LeastConnections, Some(counts.clone()));
        // b has no sessions, c has one, a has two.
        assert_eq!(balancer.arrange(&hosts()), vec!["b", "c", "a"]);

        // Ties keep configured order.
        counts.lock().unwrap().insert("b".to_string(), 1);
        assert_eq!(balancer.arrange(&hosts()), vec!["b", "c", "a"]);
    }
}
