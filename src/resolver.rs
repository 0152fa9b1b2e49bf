//! Registry-to-directory bridge.
//!
//! A [`Resolver`] owns one registry subscription and one background task. The
//! task turns every instance list from the [`WatchAdapter`] into a new
//! [`Snapshot`], publishes it to the [`Directory`], and forwards it to the
//! framework's [`UpdateSink`]. Selection runs on caller tasks against whatever
//! snapshot is current and never waits on the background task.
//!
//! # States
//!
//! `Initializing → Active ⇄ Degraded → Closed`. The first batch moves the
//! resolver to `Active`. Watch failures that outlast the retry budget move it to
//! `Degraded`, where the last good snapshot stays selectable; the next batch
//! moves it back. `Closed` is terminal.
//!
//! # Example
//!
//! ```ignore
//! use tonic::transport::{Channel, Endpoint};
//! use tonic_lb_discovery::{BalanceChannelSink, ResolverBuilder, ResolverConfig};
//!
//! let (channel, tx) = Channel::balance_channel::<String>(1024);
//! let sink = BalanceChannelSink::new(tx, |node| {
//!     Endpoint::from_shared(format!("http://{}", node.address())).unwrap()
//! });
//!
//! let resolver = ResolverBuilder::new(registry)
//!     .build("discovery:///greeter", sink, ResolverConfig::new().insecure(true))
//!     .await?;
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::balancer::{Balancers, P2C};
use crate::error::{Error, Result};
use crate::filter::{FilterChain, NodeFilter};
use crate::node::{Directory, Node, Outcome, Snapshot};
use crate::registry::{Registry, ServiceInstance};
use crate::selector::Selector;
use crate::sink::UpdateSink;
use crate::watch::{BackoffConfig, WatchAdapter, WatchOptions};

/// Target URI scheme served by this resolver.
pub const SCHEME: &str = "discovery";

/// Lifecycle state of a [`Resolver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolverState {
    /// Subscribed; nothing published yet.
    Initializing,
    /// Serving the latest registry view.
    Active,
    /// The watch is failing; the last good snapshot is still served.
    Degraded,
    /// Shut down.
    Closed,
}

/// Configuration for a [`Resolver`].
#[derive(Clone)]
pub struct ResolverConfig {
    /// Resolve plaintext `grpc` endpoints instead of `grpcs` ones.
    pub insecure: bool,

    /// Bound on each attempt to open the registry watch.
    pub timeout: Duration,

    /// Bound on each wait for the next registry batch.
    /// `None` waits indefinitely.
    pub receive_timeout: Option<Duration>,

    /// Name of the balancing policy, looked up in [`Balancers`].
    pub balancer_name: String,

    /// Filters applied before every selection.
    pub filters: Vec<NodeFilter>,

    /// Publish empty instance lists even when nodes are currently known.
    pub trust_empty: bool,

    /// Log every published address list at `info`.
    pub debug: bool,

    /// Retry schedule for re-opening a failed watch.
    pub backoff: BackoffConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            insecure: false,
            timeout: Duration::from_secs(10),
            receive_timeout: None,
            balancer_name: P2C.to_string(),
            filters: Vec::new(),
            trust_empty: false,
            debug: false,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ResolverConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves plaintext endpoints when `true`.
    #[must_use]
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Sets the subscribe timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the per-receive timeout.
    #[must_use]
    pub fn receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Selects the balancing policy by name.
    #[must_use]
    pub fn balancer(mut self, name: impl Into<String>) -> Self {
        self.balancer_name = name.into();
        self
    }

    /// Appends a node filter.
    #[must_use]
    pub fn filter(mut self, filter: NodeFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Opts into publishing empty instance lists.
    #[must_use]
    pub fn trust_empty(mut self, trust: bool) -> Self {
        self.trust_empty = trust;
        self
    }

    /// Enables verbose publication logging.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Sets the retry schedule.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Endpoint scheme resolved for this configuration.
    #[must_use]
    pub fn endpoint_scheme(&self) -> &'static str {
        if self.insecure { "grpc" } else { "grpcs" }
    }

    fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            timeout: self.timeout,
            receive_timeout: self.receive_timeout,
            backoff: self.backoff.clone(),
        }
    }
}

impl fmt::Debug for ResolverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverConfig")
            .field("insecure", &self.insecure)
            .field("timeout", &self.timeout)
            .field("receive_timeout", &self.receive_timeout)
            .field("balancer_name", &self.balancer_name)
            .field("filters", &self.filters.len())
            .field("trust_empty", &self.trust_empty)
            .field("debug", &self.debug)
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// Creates [`Resolver`]s for targets of the `discovery` scheme.
#[derive(Debug)]
pub struct ResolverBuilder<R> {
    registry: Arc<R>,
    balancers: Balancers,
}

impl<R: Registry> ResolverBuilder<R> {
    /// Creates a builder over `registry` with the standard balancers.
    #[must_use]
    pub fn new(registry: R) -> Self {
        Self::with_registry(Arc::new(registry))
    }

    /// Creates a builder over a shared registry.
    #[must_use]
    pub fn with_registry(registry: Arc<R>) -> Self {
        Self {
            registry,
            balancers: Balancers::default(),
        }
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
        SCHEME
    }

    /// Subscribes to the service named by `target` and starts reconciling.
    ///
    /// `target` is `discovery:///<service>`, `discovery://<authority>/<service>`
    /// or a bare service name. Returns once the subscription is open; use
    /// [`Resolver::ready`] to wait for the first publication.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTarget`], [`Error::UnknownBalancer`], or
    /// [`Error::SubscriptionFailed`] if the registry watch cannot be opened.
    pub async fn build<S: UpdateSink>(
        &self,
        target: &str,
        sink: S,
        config: ResolverConfig,
    ) -> Result<Resolver> {
        let service = parse_target(target)?;
        let balancer = self
            .balancers
            .build(&config.balancer_name)
            .ok_or_else(|| Error::UnknownBalancer(config.balancer_name.clone()))?;

        let cancel = CancellationToken::new();
        let adapter = WatchAdapter::subscribe(
            Arc::clone(&self.registry),
            service.clone(),
            config.watch_options(),
            cancel.clone(),
        )
        .await?;

        let directory = Arc::new(Directory::new());
        let selector = Selector::new(
            Arc::clone(&directory),
            FilterChain::new(config.filters.clone()),
            balancer,
        );

        let state = Arc::new(watch::Sender::new(ResolverState::Initializing));
        let reconciler = Reconciler {
            adapter,
            directory,
            sink: Some(sink),
            state: Arc::clone(&state),
            service: service.clone(),
            scheme: config.endpoint_scheme(),
            trust_empty: config.trust_empty,
            debug: config.debug,
            cancel: cancel.clone(),
            version: 0,
        };

        tracing::debug!(
            service = %service,
            balancer = %config.balancer_name,
            "starting resolver"
        );

        let task = tokio::spawn(reconciler.run());

        Ok(Resolver {
            service,
            selector,
            state,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Extracts the service name from a target URI.
pub(crate) fn parse_target(target: &str) -> Result<String> {
    let path = match target.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map_or("", |(_, path)| path),
        None => target,
    };

    let service = path.trim_matches('/');
    if service.is_empty() {
        return Err(Error::InvalidTarget(target.to_string()));
    }

    Ok(service.to_string())
}

/// A live, continuously reconciled view of one service.
///
/// Dropping the resolver closes it.
pub struct Resolver {
    service: String,
    selector: Selector,
    state: Arc<watch::Sender<ResolverState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Resolver {
    /// A resolver serving whatever `selector` reads, with no background task.
    pub(crate) fn fixed(service: String, selector: Selector) -> Self {
        Self {
            service,
            selector,
            state: Arc::new(watch::Sender::new(ResolverState::Active)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Name of the resolved service.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ResolverState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ResolverState> {
        self.state.subscribe()
    }

    /// Waits until the first snapshot has been published.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the resolver closes first.
    pub async fn ready(&self) -> Result<()> {
        let mut changes = self.state.subscribe();
        let state = *changes
            .wait_for(|s| *s != ResolverState::Initializing)
            .await
            .map_err(|_| Error::Closed)?;

        match state {
            ResolverState::Closed => Err(Error::Closed),
            _ => Ok(()),
        }
    }

    /// The currently published snapshot, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.selector.directory().get()
    }

    /// A selector over this resolver's directory.
    #[must_use]
    pub fn selector(&self) -> Selector {
        self.selector.clone()
    }

    /// Selects a node for one call.
    ///
    /// # Errors
    ///
    /// See [`Selector::select`].
    pub fn select(&self) -> Result<Arc<Node>> {
        self.selector.select()
    }

    /// Reports the outcome of a call made to `node`.
    pub fn report(&self, node: &Node, outcome: Outcome) {
        self.selector.report(node, outcome);
    }

    /// Closes the resolver. Idempotent.
    ///
    /// Cancels the subscription and fails later selections with
    /// [`Error::Closed`]; nodes already handed out stay usable.
    pub fn close(&self) {
        self.selector.close();
        self.cancel.cancel();
        let previous = self.state.send_replace(ResolverState::Closed);
        if previous != ResolverState::Closed {
            tracing::debug!(service = %self.service, "resolver closed");
        }
    }

    /// Closes the resolver and waits for its background task to exit.
    pub async fn shutdown(&self) {
        self.close();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!(service = %self.service, "resolver task failed: {e}");
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("service", &self.service)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Moves the state forward unless the resolver is closed.
fn transition(state: &watch::Sender<ResolverState>, next: ResolverState) {
    state.send_if_modified(|current| {
        if *current == ResolverState::Closed || *current == next {
            return false;
        }

        *current = next;
        true
    });
}

/// Background task body: watches, translates, publishes.
struct Reconciler<R: Registry, S> {
    adapter: WatchAdapter<R>,
    directory: Arc<Directory>,
    sink: Option<S>,
    state: Arc<watch::Sender<ResolverState>>,
    service: String,
    scheme: &'static str,
    trust_empty: bool,
    debug: bool,
    cancel: CancellationToken,
    version: u64,
}

impl<R: Registry, S: UpdateSink> Reconciler<R, S> {
    async fn run(mut self) {
        loop {
            match self.adapter.next_batch().await {
                Ok(instances) => self.apply(&instances).await,
                Err(Error::Closed) => break,
                // Nothing to fall back on yet.
                Err(e) if !self.directory.is_initialized() => {
                    tracing::warn!(
                        service = %self.service,
                        "registry watch failing before first update: {e}"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        service = %self.service,
                        "registry watch degraded, serving last snapshot: {e}"
                    );
                    transition(&self.state, ResolverState::Degraded);
                }
            }
        }

        self.adapter.stop();
        self.state.send_replace(ResolverState::Closed);
        tracing::debug!(service = %self.service, "resolver task stopped");
    }

    async fn apply(&mut self, instances: &[ServiceInstance]) {
        if self.cancel.is_cancelled() {
            return;
        }

        let current = self.directory.get();
        let nodes = self.translate(instances, current.as_deref());

        if nodes.is_empty()
            && !self.trust_empty
            && let Some(current) = current.as_deref()
            && !current.is_empty()
        {
            tracing::warn!(
                service = %self.service,
                "zero endpoints received, keeping {} known nodes",
                current.len()
            );
            transition(&self.state, ResolverState::Active);
            return;
        }

        self.version += 1;
        let snapshot = self.directory.replace(Snapshot::new(self.version, nodes));
        transition(&self.state, ResolverState::Active);

        let addresses: Vec<&str> = snapshot.addresses().collect();
        if self.debug {
            tracing::info!(service = %self.service, version = self.version, "published {addresses:?}");
        } else {
            tracing::debug!(service = %self.service, version = self.version, "published {} nodes", addresses.len());
        }

        if let Some(sink) = self.sink.as_mut()
            && sink.update(snapshot).await.is_err()
        {
            tracing::warn!(service = %self.service, "update sink closed, no longer forwarding snapshots");
            self.sink = None;
        }
    }

    /// Converts instances into nodes, reusing unchanged nodes from `current`.
    fn translate(&self, instances: &[ServiceInstance], current: Option<&Snapshot>) -> Vec<Arc<Node>> {
        let known: HashMap<&str, &Arc<Node>> = current
            .map(|s| s.nodes().iter().map(|n| (n.address(), n)).collect())
            .unwrap_or_default();

        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(instances.len());

        for instance in instances {
            let node = match Node::from_instance(instance, self.scheme) {
                Ok(node) => node,
                Err(e) => {
                    tracing::warn!(service = %self.service, "dropping instance: {e}");
                    continue;
                }
            };

            if !seen.insert(node.address().to_string()) {
                tracing::debug!(
                    service = %self.service,
                    "skipping duplicate address {} of instance {}",
                    node.address(),
                    node.id()
                );
                continue;
            }

            match known.get(node.address()) {
                Some(old) if old.same_backend(&node) => nodes.push(Arc::clone(old)),
                _ => nodes.push(Arc::new(node)),
            }
        }

        nodes
    }
}
