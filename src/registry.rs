//! Service registry collaborator interface.
//!
//! A [`Registry`] answers one-shot lookups and opens [`Watcher`]s that yield
//! the full instance list of a service every time it changes. Concrete
//! backends live outside this crate, except for [`MemoryRegistry`] (useful for
//! local development and tests) and, with the `kubernetes` feature, the
//! `EndpointSlice` backed registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::error::RegistryError;

/// A backend process registered under a logical service name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Unique instance ID assigned by the registry.
    pub id: String,
    /// Logical service name.
    pub name: String,
    /// Version tag of the deployed build.
    pub version: String,
    /// Arbitrary key/value metadata.
    pub metadata: HashMap<String, String>,
    /// Endpoint URIs, e.g. `grpc://10.0.0.1:9000`.
    pub endpoints: Vec<String>,
}

impl ServiceInstance {
    /// Creates an instance with no endpoints or metadata.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets the version tag.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Adds an endpoint URI.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns the `host:port` of the first endpoint with the given scheme.
    #[must_use]
    pub fn endpoint_for(&self, scheme: &str) -> Option<&str> {
        self.endpoints
            .iter()
            .find_map(|endpoint| parse_endpoint(endpoint, scheme))
    }
}

/// Extracts the authority of `endpoint` if its scheme is `scheme`.
fn parse_endpoint<'a>(endpoint: &'a str, scheme: &str) -> Option<&'a str> {
    let (found, rest) = endpoint.split_once("://")?;
    if !found.eq_ignore_ascii_case(scheme) {
        return None;
    }

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    (!authority.is_empty()).then_some(authority)
}

/// Service discovery backend.
pub trait Registry: Send + Sync + 'static {
    /// Watcher type returned by [`Registry::watch`].
    type Watcher: Watcher;

    /// Returns the current instances of `service`.
    fn get_service(
        &self,
        service: &str,
    ) -> impl Future<Output = Result<Vec<ServiceInstance>, RegistryError>> + Send;

    /// Opens a change stream for `service`.
    fn watch(
        &self,
        service: &str,
    ) -> impl Future<Output = Result<Self::Watcher, RegistryError>> + Send;
}

/// A single registry subscription.
///
/// The first call to [`Watcher::next`] yields the current instance list; each
/// later call blocks until the list changes.
pub trait Watcher: Send + 'static {
    /// Waits for the next full instance list.
    fn next(
        &mut self,
    ) -> impl Future<Output = Result<Vec<ServiceInstance>, RegistryError>> + Send;

    /// Releases the subscription. Calling it more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to release its resources.
    fn stop(&mut self) -> Result<(), RegistryError>;
}

type Services = HashMap<String, watch::Sender<Vec<ServiceInstance>>>;

/// In-process registry.
///
/// Instances are registered and deregistered directly; every change is
/// broadcast to open watchers of the affected service.
#[derive(Clone, Debug, Default)]
pub struct MemoryRegistry {
    services: Arc<Mutex<Services>>,
}

impl MemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `instance`, replacing any instance with the same ID.
    pub fn register(&self, instance: ServiceInstance) {
        let sender = self.sender(&instance.name);
        sender.send_modify(|instances| {
            instances.retain(|i| i.id != instance.id);
            instances.push(instance);
        });
    }

    /// Removes the instance with `id` from `service`.
    pub fn deregister(&self, service: &str, id: &str) {
        self.sender(service)
            .send_modify(|instances| instances.retain(|i| i.id != id));
    }

    /// Replaces the whole instance list of `service`.
    pub fn set(&self, service: &str, instances: Vec<ServiceInstance>) {
        self.sender(service).send_replace(instances);
    }

    fn sender(&self, service: &str) -> watch::Sender<Vec<ServiceInstance>> {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        services
            .entry(service.to_string())
            .or_insert_with(|| watch::Sender::new(Vec::new()))
            .clone()
    }
}

impl Registry for MemoryRegistry {
    type Watcher = MemoryWatcher;

    async fn get_service(&self, service: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        Ok(self.sender(service).borrow().clone())
    }

    async fn watch(&self, service: &str) -> Result<MemoryWatcher, RegistryError> {
        let mut rx = self.sender(service).subscribe();
        rx.mark_changed();
        Ok(MemoryWatcher { rx: Some(rx) })
    }
}

/// Watcher returned by [`MemoryRegistry::watch`].
#[derive(Debug)]
pub struct MemoryWatcher {
    rx: Option<watch::Receiver<Vec<ServiceInstance>>>,
}

impl Watcher for MemoryWatcher {
    async fn next(&mut self) -> Result<Vec<ServiceInstance>, RegistryError> {
        let rx = self.rx.as_mut().ok_or(RegistryError::Stopped)?;
        rx.changed()
            .await
            .map_err(|_| RegistryError::transport("registry dropped"))?;

        Ok(rx.borrow_and_update().clone())
    }

    fn stop(&mut self) -> Result<(), RegistryError> {
        self.rx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_for_matches_scheme() {
        let instance = ServiceInstance::new("1", "greeter")
            .endpoint("http://10.0.0.1:8000")
            .endpoint("grpc://10.0.0.1:9000");

        assert_eq!(instance.endpoint_for("grpc"), Some("10.0.0.1:9000"));
        assert_eq!(instance.endpoint_for("http"), Some("10.0.0.1:8000"));
        assert_eq!(instance.endpoint_for("grpcs"), None);
    }

    #[test]
    fn endpoint_for_strips_path_and_query() {
        let instance = ServiceInstance::new("1", "greeter").endpoint("grpc://[::1]:9000/x?isSecure=false");
        assert_eq!(instance.endpoint_for("grpc"), Some("[::1]:9000"));
    }

    #[test]
    fn endpoint_for_rejects_malformed() {
        let instance = ServiceInstance::new("1", "greeter")
            .endpoint("10.0.0.1:9000")
            .endpoint("grpc://");

        assert_eq!(instance.endpoint_for("grpc"), None);
    }

    #[tokio::test]
    async fn memory_watcher_yields_current_then_changes() {
        let registry = MemoryRegistry::new();
        registry.register(ServiceInstance::new("1", "greeter").endpoint("grpc://10.0.0.1:9000"));

        let mut watcher = registry.watch("greeter").await.unwrap();
        let first = watcher.next().await.unwrap();
        assert_eq!(first.len(), 1);

        registry.register(ServiceInstance::new("2", "greeter").endpoint("grpc://10.0.0.2:9000"));
        let second = watcher.next().await.unwrap();
        assert_eq!(second.len(), 2);

        registry.deregister("greeter", "1");
        let third = watcher.next().await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].id, "2");
    }

    #[tokio::test]
    async fn memory_register_replaces_same_id() {
        let registry = MemoryRegistry::new();
        registry.register(ServiceInstance::new("1", "greeter").version("v1"));
        registry.register(ServiceInstance::new("1", "greeter").version("v2"));

        let instances = registry.get_service("greeter").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].version, "v2");
    }

    #[tokio::test]
    async fn memory_watcher_stop_is_idempotent() {
        let registry = MemoryRegistry::new();
        let mut watcher = registry.watch("greeter").await.unwrap();

        watcher.stop().unwrap();
        watcher.stop().unwrap();
        assert!(matches!(watcher.next().await, Err(RegistryError::Stopped)));
    }
}
