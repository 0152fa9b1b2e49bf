//! Selectable nodes, their live statistics, and the snapshot directory.
//!
//! A [`Snapshot`] is immutable once built. The [`Directory`] swaps the current
//! snapshot atomically, so readers on the request path never lock. Per-node
//! [`Stats`] are plain atomics mutated in place; they are shared by every
//! snapshot that carries the same [`Node`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::time::Instant;

use crate::error::Error;
use crate::registry::ServiceInstance;

/// Metadata key holding a node's weight.
pub const WEIGHT_KEY: &str = "weight";

/// Weight used when an instance does not advertise one.
pub const DEFAULT_WEIGHT: u32 = 100;

/// Outcome of a call, reported back to the selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The call succeeded after the given latency.
    Success(Duration),
    /// The call failed after the given latency.
    Failure(Duration),
}

/// Live statistics of a node.
#[derive(Debug, Default)]
pub struct Stats {
    ewma_bits: AtomicU64,
    pending: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    last_update_ns: AtomicU64,
    last_pick_ns: AtomicU64,
}

impl Stats {
    /// Smoothed latency in nanoseconds; zero until the first report.
    #[must_use]
    pub fn ewma_latency(&self) -> f64 {
        f64::from_bits(self.ewma_bits.load(Ordering::Acquire))
    }

    /// Number of calls handed out and not yet reported.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Number of successful calls reported.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Number of failed calls reported.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn begin(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn finish(&self) {
        // Saturate: a duplicate report must not wrap the counter.
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn observe(&self, latency_ns: f64, alpha: f64) {
        let _ = self
            .ewma_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                // Starts from zero, so repeated identical samples keep raising it.
                let old = f64::from_bits(bits);
                Some((alpha * latency_ns + (1.0 - alpha) * old).to_bits())
            });
    }
}

/// A selectable backend derived from a [`ServiceInstance`].
#[derive(Debug)]
pub struct Node {
    id: String,
    address: String,
    version: String,
    weight: u32,
    metadata: HashMap<String, String>,
    created: Instant,
    stats: Stats,
}

impl Node {
    /// Creates a node with default weight and no metadata.
    #[must_use]
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            version: String::new(),
            weight: DEFAULT_WEIGHT,
            metadata: HashMap::new(),
            created: Instant::now(),
            stats: Stats::default(),
        }
    }

    /// Sets the weight, clamped to at least 1.
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Sets the version tag.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builds a node from the first `scheme` endpoint of `instance`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstanceParse`] if the instance has no such endpoint.
    pub fn from_instance(instance: &ServiceInstance, scheme: &str) -> Result<Self, Error> {
        let address = instance
            .endpoint_for(scheme)
            .ok_or_else(|| Error::InstanceParse {
                instance: instance.id.clone(),
                scheme: scheme.to_string(),
            })?;

        Ok(Self {
            id: instance.id.clone(),
            address: address.to_string(),
            version: instance.version.clone(),
            weight: parse_weight(instance.metadata.get(WEIGHT_KEY).map(String::as_str)),
            metadata: instance.metadata.clone(),
            created: Instant::now(),
            stats: Stats::default(),
        })
    }

    /// Registry ID of the backing instance.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `host:port` of the backend.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Version tag of the backing instance.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Positive selection weight.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Instance metadata, verbatim.
    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Live statistics.
    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Load score; lower is better.
    ///
    /// `ewma * (1 + pending) / weight`, with the latency floored at 1ns so
    /// outstanding calls count before the first report arrives.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(&self) -> f64 {
        let latency = self.stats.ewma_latency().max(1.0);
        latency * (1 + self.stats.pending()) as f64 / f64::from(self.weight)
    }

    /// Time elapsed since this node was last picked, or since it was created.
    #[must_use]
    pub fn since_last_pick(&self) -> Duration {
        let picked = Duration::from_nanos(self.stats.last_pick_ns.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(picked)
    }

    /// Time elapsed since the last feedback report, if any.
    #[must_use]
    pub fn since_last_update(&self) -> Option<Duration> {
        match self.stats.last_update_ns.load(Ordering::Relaxed) {
            0 => None,
            ns => Some(self.created.elapsed().saturating_sub(Duration::from_nanos(ns))),
        }
    }

    /// Whether `other` describes the same backend with the same attributes.
    #[must_use]
    pub fn same_backend(&self, other: &Node) -> bool {
        self.id == other.id
            && self.address == other.address
            && self.version == other.version
            && self.weight == other.weight
            && self.metadata == other.metadata
    }

    /// Reserves the node for a new call.
    pub(crate) fn begin(&self) {
        self.stats.begin();
        self.stats
            .last_pick_ns
            .store(self.elapsed_ns(), Ordering::Relaxed);
    }

    /// Folds the outcome of a call into the statistics.
    ///
    /// Failures are recorded as `penalty` so repeatedly failing nodes drift
    /// toward the worst score.
    pub(crate) fn complete(&self, outcome: Outcome, alpha: f64, penalty: Duration) {
        self.stats.finish();
        let latency = match outcome {
            Outcome::Success(latency) => {
                self.stats.successes.fetch_add(1, Ordering::Relaxed);
                latency
            }

            Outcome::Failure(latency) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                latency.max(penalty)
            }
        };

        self.stats.observe(latency.as_secs_f64() * 1e9, alpha);
        self.stats
            .last_update_ns
            .store(self.elapsed_ns().max(1), Ordering::Relaxed);
    }

    fn elapsed_ns(&self) -> u64 {
        u64::try_from(self.created.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Parses an advertised weight, defaulting when absent or malformed.
fn parse_weight(raw: Option<&str>) -> u32 {
    let Some(raw) = raw else {
        return DEFAULT_WEIGHT;
    };

    match raw.trim().parse::<i64>() {
        Ok(weight) => u32::try_from(weight.max(1)).unwrap_or(u32::MAX),
        Err(_) => {
            tracing::warn!("ignoring malformed weight {raw:?}");
            DEFAULT_WEIGHT
        }
    }
}

/// Immutable, versioned set of nodes.
#[derive(Debug, Default)]
pub struct Snapshot {
    version: u64,
    nodes: Vec<Arc<Node>>,
}

impl Snapshot {
    /// Creates a snapshot.
    #[must_use]
    pub fn new(version: u64, nodes: Vec<Arc<Node>>) -> Self {
        Self { version, nodes }
    }

    /// Publication counter of this snapshot.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Nodes in publication order.
    #[must_use]
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the snapshot has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Addresses of all nodes.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.address())
    }

    /// Looks up a node by address.
    #[must_use]
    pub fn find(&self, address: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.address() == address)
    }
}

/// Holder of the current [`Snapshot`].
#[derive(Debug, Default)]
pub struct Directory {
    current: ArcSwapOption<Snapshot>,
}

impl Directory {
    /// Creates an uninitialized directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current snapshot, or `None` before the first publication.
    #[must_use]
    pub fn get(&self) -> Option<Arc<Snapshot>> {
        self.current.load_full()
    }

    /// Publishes `snapshot`, replacing the current one.
    pub fn replace(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        self.current.store(Some(Arc::clone(&snapshot)));
        snapshot
    }

    /// Whether a snapshot has been published.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.current.load().is_some()
    }
}
