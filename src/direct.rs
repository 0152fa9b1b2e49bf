//! Static resolution from addresses listed in the target.
//!
//! `direct:///10.0.0.1:9000,10.0.0.2:9000` resolves to a single snapshot of
//! those addresses, published once. There is no registry and nothing to
//! refresh, but selection, filters and feedback work as for discovered nodes.

use std::collections::HashSet;
use std::sync::Arc;

use crate::balancer::Balancers;
use crate::error::{Error, Result};
use crate::filter::FilterChain;
use crate::node::{Directory, Node, Snapshot};
use crate::resolver::{Resolver, ResolverConfig, parse_target};
use crate::selector::Selector;
use crate::sink::UpdateSink;

/// Target URI scheme served by [`DirectBuilder`].
pub const DIRECT_SCHEME: &str = "direct";

/// Creates [`Resolver`]s for targets of the `direct` scheme.
#[derive(Debug, Default)]
pub struct DirectBuilder {
    balancers: Balancers,
}

impl DirectBuilder {
    /// Creates a builder with the standard balancers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the balancer factories.
    #[must_use]
    pub fn balancers(mut self, balancers: Balancers) -> Self {
        self.balancers = balancers;
        self
    }

    /// Target scheme this builder serves.
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        DIRECT_SCHEME
    }

    /// Publishes the addresses in `target` and returns an active resolver.
    ///
    /// Only `filters` and `balancer_name` of `config` apply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTarget`] if the target lists no address, and
    /// [`Error::UnknownBalancer`] for an unregistered policy name.
    pub async fn build<S: UpdateSink>(
        &self,
        target: &str,
        mut sink: S,
        config: ResolverConfig,
    ) -> Result<Resolver> {
        let path = parse_target(target)?;
        let addresses = parse_addresses(&path);
        if addresses.is_empty() {
            return Err(Error::InvalidTarget(target.to_string()));
        }

        let balancer = self
            .balancers
            .build(&config.balancer_name)
            .ok_or_else(|| Error::UnknownBalancer(config.balancer_name.clone()))?;

        let nodes = addresses
            .into_iter()
            .map(|address| Arc::new(Node::new(address, address)))
            .collect();

        let directory = Arc::new(Directory::new());
        let snapshot = directory.replace(Snapshot::new(1, nodes));
        tracing::debug!("resolved {} direct addresses from {target}", snapshot.len());

        if sink.update(snapshot).await.is_err() {
            tracing::warn!("update sink closed before direct snapshot for {target} was delivered");
        }

        let selector = Selector::new(directory, FilterChain::new(config.filters), balancer);
        Ok(Resolver::fixed(path, selector))
    }
}

/// Splits a comma-separated address list, dropping blanks and duplicates.
fn parse_addresses(path: &str) -> Vec<&str> {
    let mut seen = HashSet::new();
    path.split(',')
        .map(str::trim)
        .filter(|address| !address.is_empty() && seen.insert(*address))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::filter::fn_filter;
    use crate::node::Outcome;
    use crate::resolver::ResolverState;

    #[test]
    fn addresses_are_split_and_deduplicated() {
        assert_eq!(parse_addresses("a:1,b:2"), ["a:1", "b:2"]);
        assert_eq!(parse_addresses(" a:1 , ,a:1,b:2,"), ["a:1", "b:2"]);
        assert!(parse_addresses(",,").is_empty());
    }

    #[tokio::test]
    async fn publishes_one_fixed_snapshot() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Snapshot>>();
        let resolver = DirectBuilder::new()
            .build("direct:///10.0.0.1:9000,10.0.0.2:9000", tx, ResolverConfig::new())
            .await
            .unwrap();

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.version(), 1);
        assert_eq!(snapshot.addresses().collect::<Vec<_>>(), ["10.0.0.1:9000", "10.0.0.2:9000"]);

        assert_eq!(resolver.service(), "10.0.0.1:9000,10.0.0.2:9000");
        assert_eq!(resolver.state(), ResolverState::Active);
        resolver.ready().await.unwrap();

        let node = resolver.select().unwrap();
        resolver.report(&node, Outcome::Success(Duration::from_millis(1)));
        assert_eq!(node.stats().pending(), 0);
    }

    #[tokio::test]
    async fn filters_and_close_apply() {
        let config = ResolverConfig::new().filter(fn_filter(|n| n.address() == "10.0.0.2:9000"));
        let resolver = DirectBuilder::new()
            .build("direct:///10.0.0.1:9000,10.0.0.2:9000", (), config)
            .await
            .unwrap();

        for _ in 0..20 {
            assert_eq!(resolver.select().unwrap().address(), "10.0.0.2:9000");
        }

        resolver.close();
        resolver.shutdown().await;
        assert_eq!(resolver.state(), ResolverState::Closed);
        assert!(matches!(resolver.select(), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn rejects_targets_without_addresses() {
        for target in ["direct:///", "direct:///,,", ""] {
            let result = DirectBuilder::new().build(target, (), ResolverConfig::new()).await;
            assert!(matches!(result, Err(Error::InvalidTarget(_))), "{target}");
        }
    }

    #[tokio::test]
    async fn rejects_unknown_balancer() {
        let result = DirectBuilder::new()
            .build("direct:///10.0.0.1:9000", (), ResolverConfig::new().balancer("ring_hash"))
            .await;

        assert!(matches!(result, Err(Error::UnknownBalancer(name)) if name == "ring_hash"));
    }

    #[test]
    fn builder_scheme() {
        assert_eq!(DirectBuilder::new().scheme(), "direct");
    }
}
