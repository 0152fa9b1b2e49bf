//! Power-of-two-choices balancing with EWMA latency feedback.
//!
//! Two distinct candidates are drawn at random and the one with the lower
//! [`Node::score`] wins. Scores fold in smoothed latency, outstanding calls and
//! weight, so the policy spreads load without looking at the whole fleet.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::balancer::Balancer;
use crate::node::{Node, Outcome};

/// Tuning for [`P2c`].
#[derive(Clone, Debug)]
pub struct P2cConfig {
    /// Weight of a new latency sample in the moving average, in `(0, 1]`.
    pub alpha: f64,

    /// Latency ceiling used to derive the failure penalty.
    pub latency_ceiling: Duration,

    /// A failed call is recorded as `latency_ceiling * failure_multiplier`.
    pub failure_multiplier: u32,

    /// A candidate not picked for this long is picked regardless of score,
    /// giving a node that was failing a chance to show it recovered.
    /// `None` disables probing.
    pub force_pick_interval: Option<Duration>,
}

impl Default for P2cConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            latency_ceiling: Duration::from_secs(1),
            failure_multiplier: 5,
            force_pick_interval: Some(Duration::from_secs(3)),
        }
    }
}

impl P2cConfig {
    /// Sets the moving-average decay, clamped to `(0, 1]`.
    #[must_use]
    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha.clamp(f64::EPSILON, 1.0);
        self
    }

    /// Sets the latency ceiling.
    #[must_use]
    pub fn latency_ceiling(mut self, ceiling: Duration) -> Self {
        self.latency_ceiling = ceiling;
        self
    }

    /// Sets the failure penalty multiplier.
    #[must_use]
    pub fn failure_multiplier(mut self, multiplier: u32) -> Self {
        self.failure_multiplier = multiplier.max(1);
        self
    }

    /// Sets or disables the forced-pick interval.
    #[must_use]
    pub fn force_pick_interval(mut self, interval: Option<Duration>) -> Self {
        self.force_pick_interval = interval;
        self
    }

    /// Latency recorded for a failed call.
    #[must_use]
    pub fn failure_penalty(&self) -> Duration {
        self.latency_ceiling.saturating_mul(self.failure_multiplier)
    }
}

/// The power-of-two-choices balancer.
#[derive(Debug, Default)]
pub struct P2c {
    config: P2cConfig,
}

impl P2c {
    /// Creates a balancer with the given tuning.
    #[must_use]
    pub fn new(config: P2cConfig) -> Self {
        Self { config }
    }

    /// Current tuning.
    #[must_use]
    pub fn config(&self) -> &P2cConfig {
        &self.config
    }
}

impl Balancer for P2c {
    fn pick(&self, candidates: &[Arc<Node>]) -> Arc<Node> {
        let mut rng = rand::thread_rng();
        let (a, b) = if candidates.len() == 2 {
            (&candidates[0], &candidates[1])
        } else {
            let i = rng.gen_range(0..candidates.len());
            let mut j = rng.gen_range(0..candidates.len() - 1);
            if j >= i {
                j += 1;
            }

            (&candidates[i], &candidates[j])
        };

        let a_wins = match a.score().partial_cmp(&b.score()) {
            Some(Ordering::Less) => true,
            Some(Ordering::Greater) => false,
            _ => rng.gen_bool(0.5),
        };

        let (winner, loser) = if a_wins { (a, b) } else { (b, a) };

        if let Some(interval) = self.config.force_pick_interval
            && loser.since_last_pick() > interval
        {
            tracing::debug!(address = loser.address(), "probing idle node");
            return Arc::clone(loser);
        }

        Arc::clone(winner)
    }

    fn report(&self, node: &Node, outcome: Outcome) {
        node.complete(outcome, self.config.alpha, self.config.failure_penalty());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn nodes(n: usize) -> Vec<Arc<Node>> {
        (0..n)
            .map(|i| Arc::new(Node::new(i.to_string(), format!("10.0.0.{i}:9000"))))
            .collect()
    }

    fn select(p2c: &P2c, candidates: &[Arc<Node>]) -> Arc<Node> {
        let node = p2c.pick(candidates);
        node.begin();
        node
    }

    #[test]
    fn failure_penalty_scales_ceiling() {
        let config = P2cConfig::default()
            .latency_ceiling(Duration::from_millis(200))
            .failure_multiplier(3);

        assert_eq!(config.failure_penalty(), Duration::from_millis(600));
    }

    #[test]
    fn picks_distinct_pair_from_larger_sets() {
        let candidates = nodes(5);
        let p2c = P2c::default();
        for _ in 0..10 {
            candidates[2].begin();
        }

        // Node 2 loses every comparison it takes part in, so it is never picked.
        for _ in 0..1_000 {
            assert_ne!(p2c.pick(&candidates).id(), "2");
        }
    }

    #[test]
    fn equal_nodes_share_load_evenly() {
        let candidates = nodes(2);
        let p2c = P2c::default();
        let mut counts: HashMap<String, usize> = HashMap::new();

        for _ in 0..2_000 {
            let node = select(&p2c, &candidates);
            *counts.entry(node.id().to_string()).or_default() += 1;
        }

        for count in counts.values() {
            assert!(count.abs_diff(1_000) <= 50, "unbalanced: {counts:?}");
        }
    }

    #[test]
    fn prefers_lower_latency() {
        let candidates = nodes(2);
        let p2c = P2c::default();

        p2c.report(&candidates[0], Outcome::Success(Duration::from_millis(50)));
        p2c.report(&candidates[1], Outcome::Success(Duration::from_millis(5)));

        let node = p2c.pick(&candidates);
        assert_eq!(node.id(), "1");
    }

    #[test]
    fn respects_weight() {
        let candidates = vec![
            Arc::new(Node::new("light", "10.0.0.1:9000").with_weight(10)),
            Arc::new(Node::new("heavy", "10.0.0.2:9000").with_weight(1_000)),
        ];
        let p2c = P2c::default();

        assert_eq!(p2c.pick(&candidates).id(), "heavy");
    }

    #[test]
    fn failing_node_score_rises_with_each_failure() {
        let node = Node::new("a", "10.0.0.1:9000");
        let p2c = P2c::default();

        let mut last = node.score();
        for _ in 0..20 {
            node.begin();
            p2c.report(&node, Outcome::Failure(Duration::from_millis(2)));
            let score = node.score();
            assert!(score > last);
            last = score;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_loser_is_picked_anyway() {
        let candidates = nodes(2);
        let p2c = P2c::new(P2cConfig::default().force_pick_interval(Some(Duration::from_secs(3))));

        p2c.report(&candidates[0], Outcome::Failure(Duration::ZERO));
        p2c.report(&candidates[1], Outcome::Success(Duration::from_millis(1)));
        assert_eq!(select(&p2c, &candidates).id(), "1");

        tokio::time::advance(Duration::from_secs(4)).await;
        candidates[1].begin();
        assert_eq!(p2c.pick(&candidates).id(), "0");
    }

    #[tokio::test(start_paused = true)]
    async fn probing_can_be_disabled() {
        let candidates = nodes(2);
        let p2c = P2c::new(P2cConfig::default().force_pick_interval(None));

        p2c.report(&candidates[0], Outcome::Failure(Duration::ZERO));
        p2c.report(&candidates[1], Outcome::Success(Duration::from_millis(1)));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(p2c.pick(&candidates).id(), "1");
    }
}
