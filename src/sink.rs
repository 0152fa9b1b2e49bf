//! Delivery of published snapshots to the RPC client framework.
//!
//! The resolver calls [`UpdateSink::update`] after every publication. Besides
//! plain channel sinks, [`BalanceChannelSink`] feeds a tonic balance channel:
//!
//! ```ignore
//! use tonic::transport::{Channel, Endpoint};
//! use tonic_lb_discovery::BalanceChannelSink;
//!
//! let (channel, tx) = Channel::balance_channel::<String>(1024);
//! let sink = BalanceChannelSink::new(tx, |node| {
//!     Endpoint::from_shared(format!("http://{}", node.address())).unwrap()
//! });
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use crate::node::{Node, Snapshot};

/// The receiving side of a sink has gone away.
#[derive(Debug, Error)]
#[error("update sink closed")]
pub struct SinkClosed;

/// Receiver of published snapshots.
pub trait UpdateSink: Send + 'static {
    /// Delivers a newly published snapshot.
    fn update(
        &mut self,
        snapshot: Arc<Snapshot>,
    ) -> impl Future<Output = Result<(), SinkClosed>> + Send;
}

/// Discards every update; selection still works through the resolver.
impl UpdateSink for () {
    async fn update(&mut self, _snapshot: Arc<Snapshot>) -> Result<(), SinkClosed> {
        Ok(())
    }
}

impl UpdateSink for mpsc::Sender<Arc<Snapshot>> {
    async fn update(&mut self, snapshot: Arc<Snapshot>) -> Result<(), SinkClosed> {
        self.send(snapshot).await.map_err(|_| SinkClosed)
    }
}

impl UpdateSink for mpsc::UnboundedSender<Arc<Snapshot>> {
    async fn update(&mut self, snapshot: Arc<Snapshot>) -> Result<(), SinkClosed> {
        self.send(snapshot).map_err(|_| SinkClosed)
    }
}

impl UpdateSink for watch::Sender<Option<Arc<Snapshot>>> {
    async fn update(&mut self, snapshot: Arc<Snapshot>) -> Result<(), SinkClosed> {
        self.send(Some(snapshot)).map_err(|_| SinkClosed)
    }
}

/// Sink that translates snapshots into tonic balance-channel changes.
///
/// Each publication is diffed against the addresses already handed to the
/// channel: new addresses are inserted with an [`Endpoint`] built by the
/// user's function, vanished ones are removed.
pub struct BalanceChannelSink<F> {
    tx: mpsc::Sender<Change<String, Endpoint>>,
    build: F,
    known: HashSet<String>,
}

impl<F> BalanceChannelSink<F>
where
    F: Fn(&Node) -> Endpoint + Send + 'static,
{
    /// Creates a sink feeding `tx` (from `Channel::balance_channel()`).
    pub fn new(tx: mpsc::Sender<Change<String, Endpoint>>, build: F) -> Self {
        Self {
            tx,
            build,
            known: HashSet::new(),
        }
    }
}

impl<F> UpdateSink for BalanceChannelSink<F>
where
    F: Fn(&Node) -> Endpoint + Send + 'static,
{
    async fn update(&mut self, snapshot: Arc<Snapshot>) -> Result<(), SinkClosed> {
        for action in diff(&mut self.known, &snapshot) {
            let change = match action {
                EndpointAction::Insert(addr) => {
                    let Some(node) = snapshot.find(&addr) else {
                        continue;
                    };

                    let endpoint = (self.build)(node.as_ref());
                    Change::Insert(addr, endpoint)
                }

                EndpointAction::Remove(addr) => Change::Remove(addr),
            };

            if self.tx.send(change).await.is_err() {
                tracing::warn!("balance channel closed");
                return Err(SinkClosed);
            }
        }

        Ok(())
    }
}

/// Endpoint change for a balance channel.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EndpointAction {
    Insert(String),
    Remove(String),
}

/// Computes the changes that bring `known` in line with `snapshot`.
fn diff(known: &mut HashSet<String>, snapshot: &Snapshot) -> Vec<EndpointAction> {
    let current: HashSet<&str> = snapshot.addresses().collect();
    let mut actions = Vec::new();

    known.retain(|addr| {
        let keep = current.contains(addr.as_str());
        if !keep {
            tracing::debug!("removing endpoint: {addr}");
            actions.push(EndpointAction::Remove(addr.clone()));
        }

        keep
    });

    for addr in snapshot.addresses() {
        if known.insert(addr.to_string()) {
            tracing::debug!("adding endpoint: {addr}");
            actions.push(EndpointAction::Insert(addr.to_string()));
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(version: u64, addrs: &[&str]) -> Arc<Snapshot> {
        let nodes = addrs
            .iter()
            .map(|a| Arc::new(Node::new(*a, *a)))
            .collect();

        Arc::new(Snapshot::new(version, nodes))
    }

    fn build(node: &Node) -> Endpoint {
        Endpoint::from_shared(format!("http://{}", node.address())).unwrap()
    }

    #[test]
    fn diff_inserts_new_addresses() {
        let mut known = HashSet::new();
        let actions = diff(&mut known, &snapshot(1, &["10.0.0.1:9000", "10.0.0.2:9000"]));

        assert_eq!(actions.len(), 2);
        assert!(actions.contains(&EndpointAction::Insert("10.0.0.1:9000".to_string())));
        assert!(actions.contains(&EndpointAction::Insert("10.0.0.2:9000".to_string())));
        assert_eq!(known.len(), 2);
    }

    #[test]
    fn diff_skips_known_addresses() {
        let mut known = HashSet::from(["10.0.0.1:9000".to_string()]);
        let actions = diff(&mut known, &snapshot(1, &["10.0.0.1:9000", "10.0.0.2:9000"]));

        assert_eq!(actions, [EndpointAction::Insert("10.0.0.2:9000".to_string())]);
    }

    #[test]
    fn diff_removes_vanished_addresses() {
        let mut known = HashSet::from(["10.0.0.1:9000".to_string(), "10.0.0.2:9000".to_string()]);
        let actions = diff(&mut known, &snapshot(2, &["10.0.0.2:9000"]));

        assert_eq!(actions, [EndpointAction::Remove("10.0.0.1:9000".to_string())]);
        assert_eq!(known.len(), 1);
    }

    #[test]
    fn diff_of_empty_snapshot_removes_everything() {
        let mut known = HashSet::from(["10.0.0.1:9000".to_string()]);
        let actions = diff(&mut known, &snapshot(2, &[]));

        assert_eq!(actions, [EndpointAction::Remove("10.0.0.1:9000".to_string())]);
        assert!(known.is_empty());
    }

    #[tokio::test]
    async fn balance_sink_sends_changes() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut sink = BalanceChannelSink::new(tx, build);

        sink.update(snapshot(1, &["10.0.0.1:9000"])).await.unwrap();
        sink.update(snapshot(2, &["10.0.0.2:9000"])).await.unwrap();

        assert!(matches!(rx.recv().await, Some(Change::Insert(a, _)) if a == "10.0.0.1:9000"));
        assert!(matches!(rx.recv().await, Some(Change::Remove(a)) if a == "10.0.0.1:9000"));
        assert!(matches!(rx.recv().await, Some(Change::Insert(a, _)) if a == "10.0.0.2:9000"));
    }

    #[tokio::test]
    async fn balance_sink_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let mut sink = BalanceChannelSink::new(tx, build);
        assert!(sink.update(snapshot(1, &["10.0.0.1:9000"])).await.is_err());
    }

    #[tokio::test]
    async fn channel_sinks_forward_snapshots() {
        let (mut tx, mut rx) = mpsc::channel::<Arc<Snapshot>>(1);
        tx.update(snapshot(7, &["10.0.0.1:9000"])).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().version(), 7);

        let (mut tx, rx) = watch::channel::<Option<Arc<Snapshot>>>(None);
        tx.update(snapshot(8, &[])).await.unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().version(), 8);
    }
}
