//! Scripted registry used by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

use crate::error::RegistryError;
use crate::registry::{Registry, ServiceInstance, Watcher};

type Step = Result<Vec<ServiceInstance>, RegistryError>;

/// Registry whose watchers replay steps pushed by the test.
///
/// A watcher with no pending step blocks, like an idle watch stream.
#[derive(Clone)]
pub(crate) struct ScriptedRegistry {
    steps: mpsc::UnboundedSender<Step>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Step>>>,
    failing_watches: Arc<AtomicUsize>,
    rejecting_watches: Arc<AtomicUsize>,
    watches: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl ScriptedRegistry {
    pub(crate) fn new() -> Self {
        let (steps, queue) = mpsc::unbounded_channel();
        Self {
            steps,
            queue: Arc::new(Mutex::new(queue)),
            failing_watches: Arc::default(),
            rejecting_watches: Arc::default(),
            watches: Arc::default(),
            stops: Arc::default(),
        }
    }

    pub(crate) fn push(&self, instances: Vec<ServiceInstance>) {
        let _ = self.steps.send(Ok(instances));
    }

    pub(crate) fn push_error(&self) {
        let _ = self.steps.send(Err(RegistryError::transport("connection reset")));
    }

    pub(crate) fn fail_next_watches(&self, n: usize) {
        self.failing_watches.store(n, Ordering::SeqCst);
    }

    pub(crate) fn reject_next_watches(&self, n: usize) {
        self.rejecting_watches.store(n, Ordering::SeqCst);
    }

    pub(crate) fn watch_count(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Registry for ScriptedRegistry {
    type Watcher = ScriptedWatcher;

    async fn get_service(&self, _service: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        Ok(Vec::new())
    }

    async fn watch(&self, _service: &str) -> Result<ScriptedWatcher, RegistryError> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.rejecting_watches) {
            return Err(RegistryError::Rejected("permission denied".to_string()));
        }

        if take_one(&self.failing_watches) {
            return Err(RegistryError::transport("connection refused"));
        }

        Ok(ScriptedWatcher {
            queue: Arc::clone(&self.queue),
            stops: Arc::clone(&self.stops),
            stopped: false,
        })
    }
}

pub(crate) struct ScriptedWatcher {
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Step>>>,
    stops: Arc<AtomicUsize>,
    stopped: bool,
}

impl Watcher for ScriptedWatcher {
    async fn next(&mut self) -> Result<Vec<ServiceInstance>, RegistryError> {
        if self.stopped {
            return Err(RegistryError::Stopped);
        }

        let mut queue = self.queue.lock().await;
        match queue.recv().await {
            Some(step) => step,
            None => Err(RegistryError::Stopped),
        }
    }

    fn stop(&mut self) -> Result<(), RegistryError> {
        if !self.stopped {
            self.stopped = true;
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }
}

/// An instance with a single `grpc` endpoint.
pub(crate) fn instance(id: &str, address: &str) -> ServiceInstance {
    ServiceInstance::new(id, "greeter").endpoint(format!("grpc://{address}"))
}
