//! Balancing policies and the name-keyed factory map used to pick one.
//!
//! A [`Balancer`] only ever sees two or more candidates; filtering, the empty
//! check and the single-node fast path belong to the
//! [`Selector`](crate::Selector).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::node::{Node, Outcome};
use crate::p2c::{P2c, P2cConfig};

/// Decay used by policies that do not carry their own feedback settings.
pub const DEFAULT_ALPHA: f64 = 0.1;

/// Latency recorded for a failed call by policies without their own settings.
pub const DEFAULT_FAILURE_PENALTY: Duration = Duration::from_secs(5);

/// A load-balancing policy.
pub trait Balancer: Send + Sync + fmt::Debug {
    /// Picks one of `candidates`, which always holds at least two nodes.
    fn pick(&self, candidates: &[Arc<Node>]) -> Arc<Node>;

    /// Records the outcome of a call made to `node`.
    fn report(&self, node: &Node, outcome: Outcome) {
        node.complete(outcome, DEFAULT_ALPHA, DEFAULT_FAILURE_PENALTY);
    }
}

/// Constructs a fresh balancer instance.
pub type BalancerFactory = Arc<dyn Fn() -> Arc<dyn Balancer> + Send + Sync>;

/// Name of the power-of-two-choices policy.
pub const P2C: &str = "p2c";

/// Name of the uniform random policy.
pub const RANDOM: &str = "random";

/// Name of the round-robin policy.
pub const ROUND_ROBIN: &str = "round_robin";

/// Explicit map from policy name to factory.
///
/// Passed to the [`ResolverBuilder`](crate::ResolverBuilder) instead of a
/// process-wide registry.
#[derive(Clone)]
pub struct Balancers {
    factories: HashMap<String, BalancerFactory>,
}

impl Balancers {
    /// Creates an empty map.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Creates a map with `p2c`, `random` and `round_robin`.
    #[must_use]
    pub fn standard(p2c: P2cConfig) -> Self {
        Self::empty()
            .insert(P2C, move || Arc::new(P2c::new(p2c.clone())))
            .insert(RANDOM, || Arc::new(Random))
            .insert(ROUND_ROBIN, || Arc::new(RoundRobin::default()))
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    #[must_use]
    pub fn insert<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Balancer> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Builds the balancer registered under `name`.
    #[must_use]
    pub fn build(&self, name: &str) -> Option<Arc<dyn Balancer>> {
        self.factories.get(name).map(|factory| factory())
    }
}

impl Default for Balancers {
    fn default() -> Self {
        Self::standard(P2cConfig::default())
    }
}

impl fmt::Debug for Balancers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

/// Picks a candidate uniformly at random.
#[derive(Clone, Copy, Debug, Default)]
pub struct Random;

impl Balancer for Random {
    fn pick(&self, candidates: &[Arc<Node>]) -> Arc<Node> {
        let i = rand::thread_rng().gen_range(0..candidates.len());
        Arc::clone(&candidates[i])
    }
}

/// Cycles through candidates in order, ignoring weight.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl Balancer for RoundRobin {
    fn pick(&self, candidates: &[Arc<Node>]) -> Arc<Node> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Arc::clone(&candidates[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(n: usize) -> Vec<Arc<Node>> {
        (0..n)
            .map(|i| Arc::new(Node::new(i.to_string(), format!("10.0.0.{i}:9000"))))
            .collect()
    }

    #[test]
    fn standard_registers_builtin_policies() {
        let balancers = Balancers::default();
        for name in [P2C, RANDOM, ROUND_ROBIN] {
            assert!(balancers.build(name).is_some(), "{name}");
        }
        assert!(balancers.build("least_conn").is_none());
    }

    #[test]
    fn insert_adds_custom_policy() {
        let balancers = Balancers::empty().insert("first", || Arc::new(RoundRobin::default()));
        assert!(balancers.build("first").is_some());
        assert!(balancers.build(P2C).is_none());
    }

    #[test]
    fn round_robin_cycles() {
        let nodes = candidates(3);
        let rr = RoundRobin::default();
        let picked: Vec<_> = (0..6).map(|_| rr.pick(&nodes).id().to_string()).collect();
        assert_eq!(picked, ["0", "1", "2", "0", "1", "2"]);
    }

    #[test]
    fn random_picks_every_candidate_eventually() {
        let nodes = candidates(4);
        let mut seen = [false; 4];
        for _ in 0..1_000 {
            let node = Random.pick(&nodes);
            seen[node.id().parse::<usize>().unwrap()] = true;
        }

        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn default_report_updates_stats() {
        let node = Node::new("a", "10.0.0.1:9000");
        node.begin();
        Random.report(&node, Outcome::Failure(Duration::from_millis(1)));

        assert_eq!(node.stats().pending(), 0);
        assert_eq!(node.stats().failures(), 1);
    }
}
