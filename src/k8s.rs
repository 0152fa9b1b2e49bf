//! Kubernetes registry backed by `EndpointSlice` watches.
//!
//! Every ready address of every `EndpointSlice` labelled with the service name
//! becomes one [`ServiceInstance`] with a single `{scheme}://ip:port` endpoint.
//! The watcher keeps the slices it has seen and yields the full instance list
//! whenever any of them changes.
//!
//! # Example
//!
//! ```ignore
//! use tonic_lb_discovery::{KubernetesRegistry, ResolverBuilder, ResolverConfig};
//!
//! let registry = KubernetesRegistry::try_default(50051).await?;
//! let resolver = ResolverBuilder::new(registry)
//!     .build("discovery:///my-grpc-service", (), ResolverConfig::new().insecure(true))
//!     .await?;
//! ```
//!
//! # Requirements
//!
//! - RBAC permissions to list and watch `EndpointSlice` resources
//! - Kubernetes client configuration (in-cluster or kubeconfig)

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::ListParams;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::{Api, Client};

use crate::error::RegistryError;
use crate::registry::{Registry, ServiceInstance, Watcher};

/// Port specification for the gRPC service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Port {
    /// A numeric port number.
    Number(u16),
    /// A named port (resolved from `EndpointSlice`).
    Name(String),
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self::Number(port)
    }
}

impl From<&str> for Port {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Port {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// [`Registry`] over the Kubernetes `EndpointSlice` API.
#[derive(Clone)]
pub struct KubernetesRegistry {
    client: Client,
    namespace: String,
    port: Port,
    scheme: String,
}

impl KubernetesRegistry {
    /// Creates a registry using the client's default namespace.
    ///
    /// Instances get `grpc://` endpoints; use [`KubernetesRegistry::scheme`]
    /// with `grpcs` for resolvers that are not configured as insecure.
    #[must_use]
    pub fn new(client: Client, port: impl Into<Port>) -> Self {
        Self {
            namespace: client.default_namespace().to_string(),
            client,
            port: port.into(),
            scheme: "grpc".to_string(),
        }
    }

    /// Creates a registry from the inferred in-cluster or kubeconfig client.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Transport`] if no client configuration is found.
    pub async fn try_default(port: impl Into<Port>) -> Result<Self, RegistryError> {
        let client = Client::try_default().await.map_err(RegistryError::transport)?;
        Ok(Self::new(client, port))
    }

    /// Sets an explicit namespace for watched services.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the scheme of generated endpoint URIs.
    #[must_use]
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    fn api(&self) -> Api<EndpointSlice> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn slices(&self, service: &str) -> SliceSet {
        SliceSet::new(service, self.port.clone(), self.scheme.clone())
    }
}

impl std::fmt::Debug for KubernetesRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesRegistry")
            .field("namespace", &self.namespace)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

fn label_selector(service: &str) -> String {
    format!("kubernetes.io/service-name={service}")
}

impl Registry for KubernetesRegistry {
    type Watcher = KubernetesWatcher;

    async fn get_service(&self, service: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let params = ListParams::default().labels(&label_selector(service));
        let list = self.api().list(&params).await.map_err(RegistryError::transport)?;

        let mut slices = self.slices(service);
        for slice in list.items {
            slices.apply(Event::Apply(slice));
        }

        Ok(slices.instances())
    }

    async fn watch(&self, service: &str) -> Result<KubernetesWatcher, RegistryError> {
        let config = WatcherConfig::default().labels(&label_selector(service));
        let stream = watcher::watcher(self.api(), config).default_backoff().boxed();

        tracing::debug!(
            "Starting Kubernetes endpoint watch for {}/{service} on port {:?}",
            self.namespace,
            self.port
        );

        Ok(KubernetesWatcher {
            stream: Some(stream),
            slices: self.slices(service),
        })
    }
}

type SliceEvents = BoxStream<'static, Result<Event<EndpointSlice>, watcher::Error>>;

/// Watcher returned by [`KubernetesRegistry::watch`].
pub struct KubernetesWatcher {
    stream: Option<SliceEvents>,
    slices: SliceSet,
}

impl Watcher for KubernetesWatcher {
    async fn next(&mut self) -> Result<Vec<ServiceInstance>, RegistryError> {
        let stream = self.stream.as_mut().ok_or(RegistryError::Stopped)?;

        while let Some(event) = stream.try_next().await.map_err(RegistryError::transport)? {
            if self.slices.apply(event) {
                let instances = self.slices.instances();
                tracing::debug!(
                    "Kubernetes discovery: {} endpoints for {}",
                    instances.len(),
                    self.slices.service
                );

                return Ok(instances);
            }
        }

        Err(RegistryError::Stopped)
    }

    fn stop(&mut self) -> Result<(), RegistryError> {
        self.stream = None;
        Ok(())
    }
}

/// Instances of one service, grouped by the slice that carries them.
#[derive(Debug)]
struct SliceSet {
    service: String,
    port: Port,
    scheme: String,
    current: BTreeMap<String, Vec<ServiceInstance>>,
    relist: Option<BTreeMap<String, Vec<ServiceInstance>>>,
}

impl SliceSet {
    fn new(service: &str, port: Port, scheme: String) -> Self {
        Self {
            service: service.to_string(),
            port,
            scheme,
            current: BTreeMap::new(),
            relist: None,
        }
    }

    /// Applies a watcher event; returns whether the instance list changed.
    ///
    /// A relist (`Init` .. `InitDone`) is staged and swapped in whole.
    fn apply(&mut self, event: Event<EndpointSlice>) -> bool {
        match event {
            Event::Apply(slice) => {
                let instances = slice_instances(&slice, &self.service, &self.port, &self.scheme);
                self.current.insert(slice_name(&slice), instances);
                true
            }

            Event::Delete(slice) => self.current.remove(&slice_name(&slice)).is_some(),

            Event::Init => {
                tracing::debug!("Kubernetes watcher initialization event");
                self.relist = Some(BTreeMap::new());
                false
            }

            Event::InitApply(slice) => {
                let instances = slice_instances(&slice, &self.service, &self.port, &self.scheme);
                self.relist
                    .get_or_insert_with(BTreeMap::new)
                    .insert(slice_name(&slice), instances);
                false
            }

            Event::InitDone => {
                self.current = self.relist.take().unwrap_or_default();
                true
            }
        }
    }

    fn instances(&self) -> Vec<ServiceInstance> {
        self.current.values().flatten().cloned().collect()
    }
}

fn slice_name(slice: &EndpointSlice) -> String {
    slice.metadata.name.clone().unwrap_or_default()
}

/// Resolves the port number of `port` within `slice`.
fn resolve_port(slice: &EndpointSlice, port: &Port) -> Option<u16> {
    match port {
        Port::Number(n) => Some(*n),
        Port::Name(name) => slice.ports.as_ref().and_then(|ports| {
            ports
                .iter()
                .find(|p| p.name.as_deref() == Some(name.as_str()))
                .and_then(|p| p.port)
                .and_then(|p| u16::try_from(p).ok())
        }),
    }
}

/// Converts the ready addresses of an `EndpointSlice` into instances.
fn slice_instances(slice: &EndpointSlice, service: &str, port: &Port, scheme: &str) -> Vec<ServiceInstance> {
    let Some(port_number) = resolve_port(slice, port) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut instances = Vec::new();

    for ep in &slice.endpoints {
        // An endpoint is ready if conditions.ready is true or unset (defaults to true)
        let ready = ep.conditions.as_ref().and_then(|c| c.ready).unwrap_or(true);

        if !ready {
            continue;
        }

        for addr in &ep.addresses {
            let Ok(ip) = addr.parse::<IpAddr>() else {
                continue;
            };

            let addr = SocketAddr::new(ip, port_number);
            if !seen.insert(addr) {
                continue;
            }

            let id = ep
                .target_ref
                .as_ref()
                .and_then(|r| r.name.clone())
                .unwrap_or_else(|| addr.to_string());

            let mut instance = ServiceInstance::new(id, service).endpoint(format!("{scheme}://{addr}"));
            if let Some(zone) = &ep.zone {
                instance = instance.metadata("zone", zone.clone());
            }

            if let Some(node) = &ep.node_name {
                instance = instance.metadata("node", node.clone());
            }

            instances.push(instance);
        }
    }

    instances
}
