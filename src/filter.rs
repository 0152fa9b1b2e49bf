//! Node predicates evaluated before selection.

use std::fmt;
use std::sync::Arc;

use crate::node::{Node, Snapshot};

/// A predicate over nodes; `true` keeps the node.
pub type NodeFilter = Arc<dyn Fn(&Node) -> bool + Send + Sync>;

/// Wraps a closure as a [`NodeFilter`].
pub fn fn_filter<F>(f: F) -> NodeFilter
where
    F: Fn(&Node) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Keeps nodes whose version tag equals `version`.
pub fn version(version: impl Into<String>) -> NodeFilter {
    let version = version.into();
    Arc::new(move |node: &Node| node.version() == version)
}

/// Keeps nodes whose metadata maps `key` to `value`.
pub fn metadata(key: impl Into<String>, value: impl Into<String>) -> NodeFilter {
    let (key, value) = (key.into(), value.into());
    Arc::new(move |node: &Node| node.metadata().get(&key) == Some(&value))
}

/// Ordered, immutable set of node filters.
///
/// A node survives iff every filter accepts it. Evaluation stops at the first
/// rejecting filter, so cheap filters belong first.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<NodeFilter>,
}

impl FilterChain {
    /// Creates a chain from `filters`.
    #[must_use]
    pub fn new(filters: Vec<NodeFilter>) -> Self {
        Self { filters }
    }

    /// Appends a filter.
    #[must_use]
    pub fn push(mut self, filter: NodeFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Number of filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether the chain has no filters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Whether `node` passes every filter.
    #[must_use]
    pub fn accepts(&self, node: &Node) -> bool {
        self.filters.iter().all(|f| f(node))
    }

    /// Returns the nodes of `snapshot` that pass every filter.
    ///
    /// An empty result is not an error here; the selector reports it.
    #[must_use]
    pub fn apply(&self, snapshot: &Snapshot) -> Vec<Arc<Node>> {
        snapshot
            .nodes()
            .iter()
            .filter(|node| self.accepts(node))
            .cloned()
            .collect()
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn snapshot() -> Snapshot {
        Snapshot::new(
            1,
            vec![
                Arc::new(Node::new("a", "10.0.0.1:9000").with_version("v1").with_metadata("zone", "east")),
                Arc::new(Node::new("b", "10.0.0.2:9000").with_version("v2").with_metadata("zone", "east")),
                Arc::new(Node::new("c", "10.0.0.3:9000").with_version("v2").with_metadata("zone", "west")),
            ],
        )
    }

    fn ids(nodes: &[Arc<Node>]) -> Vec<&str> {
        nodes.iter().map(|n| n.id()).collect()
    }

    #[test]
    fn empty_chain_keeps_everything() {
        let chain = FilterChain::default();
        assert!(chain.is_empty());
        assert_eq!(ids(&chain.apply(&snapshot())), ["a", "b", "c"]);
    }

    #[test]
    fn node_must_pass_all_filters() {
        let chain = FilterChain::new(vec![version("v2"), metadata("zone", "east")]);
        assert_eq!(chain.len(), 2);
        assert_eq!(ids(&chain.apply(&snapshot())), ["b"]);
    }

    #[test]
    fn filter_order_does_not_change_result() {
        let forward = FilterChain::new(vec![version("v2"), metadata("zone", "west")]);
        let reverse = FilterChain::new(vec![metadata("zone", "west"), version("v2")]);
        assert_eq!(ids(&forward.apply(&snapshot())), ids(&reverse.apply(&snapshot())));
    }

    #[test]
    fn rejecting_everything_yields_empty() {
        let chain = FilterChain::default().push(fn_filter(|_| false));
        assert!(chain.apply(&snapshot()).is_empty());
    }

    #[test]
    fn evaluation_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let chain = FilterChain::new(vec![
            fn_filter(|_| false),
            fn_filter(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
                true
            }),
        ]);

        assert!(chain.apply(&snapshot()).is_empty());
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }
}
