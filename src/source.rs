//! Key/value configuration sources.
//!
//! A configuration [`Source`] follows the same load-then-watch shape as a
//! service [`Registry`](crate::Registry), but yields raw configuration records
//! instead of endpoints. Each record carries a format inferred from its key so
//! the application can pick a decoder.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::broadcast;

use crate::error::BoxError;

/// A configuration record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    /// Full key, e.g. `/app/config.yaml`.
    pub key: String,

    /// Raw value.
    pub value: Vec<u8>,

    /// Format inferred from the key, e.g. `yaml`. Empty when unknown.
    pub format: String,
}

impl KeyValue {
    /// Creates a record, inferring its format from `key`.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        Self {
            format: format_of(&key).to_string(),
            key,
            value: value.into(),
        }
    }
}

/// Returns the extension of the last segment of `key`, without the dot.
///
/// `/app/a.bird.json` yields `json`; `/app/config` yields an empty string.
#[must_use]
pub fn format_of(key: &str) -> &str {
    let name = key.rsplit('/').next().unwrap_or(key);
    name.rsplit_once('.').map_or("", |(_, ext)| ext)
}

/// Errors reported by configuration sources.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SourceError {
    /// The configured path is empty.
    #[error("invalid source path: {0:?}")]
    InvalidPath(String),

    /// The watcher was stopped or its store is gone.
    #[error("source watcher stopped")]
    Stopped,

    /// Failure in the backing store.
    #[error("source backend error: {0}")]
    Backend(#[source] BoxError),
}

/// A configuration store that can be loaded and watched.
pub trait Source: Send + Sync + 'static {
    /// Watcher returned by [`Source::watch`].
    type Watcher: SourceWatcher;

    /// Returns every record currently visible to this source.
    fn load(&self) -> impl Future<Output = Result<Vec<KeyValue>, SourceError>> + Send;

    /// Starts watching for changes.
    fn watch(&self) -> impl Future<Output = Result<Self::Watcher, SourceError>> + Send;
}

/// Change stream of a [`Source`].
pub trait SourceWatcher: Send + 'static {
    /// Waits for the next change and returns the full, reloaded record set.
    fn next(&mut self) -> impl Future<Output = Result<Vec<KeyValue>, SourceError>> + Send;

    /// Releases the watch. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to release its resources.
    fn stop(&mut self) -> Result<(), SourceError>;
}

/// In-process key/value store with change notification.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    changes: broadcast::Sender<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            entries: Arc::default(),
            changes,
        }
    }

    /// Writes `value` under `key` and notifies watchers.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), value.into());

        let _ = self.changes.send(key);
    }

    /// Removes `key`, notifying watchers if it existed.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some();

        if removed {
            let _ = self.changes.send(key.to_string());
        }

        removed
    }

    fn read(&self, path: &str, prefix: bool) -> Vec<KeyValue> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        if prefix {
            entries
                .range(path.to_string()..)
                .take_while(|(k, _)| k.starts_with(path))
                .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
                .collect()
        } else {
            entries
                .get(path)
                .map(|v| vec![KeyValue::new(path, v.clone())])
                .unwrap_or_default()
        }
    }
}

/// Which keys a [`MemorySource`] exposes.
#[derive(Clone, Debug, Default)]
pub struct SourceOptions {
    /// Exact key, or key prefix when `prefix` is set.
    pub path: String,

    /// Treat `path` as a prefix.
    pub prefix: bool,
}

impl SourceOptions {
    /// Options for the exact key `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            prefix: false,
        }
    }

    /// Treats the path as a prefix when `true`.
    #[must_use]
    pub fn prefix(mut self, prefix: bool) -> Self {
        self.prefix = prefix;
        self
    }
}

/// [`Source`] over a [`MemoryStore`].
#[derive(Clone, Debug)]
pub struct MemorySource {
    store: MemoryStore,
    options: SourceOptions,
}

impl MemorySource {
    /// Creates a source exposing the keys selected by `options`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidPath`] if the path is empty.
    pub fn new(store: MemoryStore, options: SourceOptions) -> Result<Self, SourceError> {
        if options.path.is_empty() {
            return Err(SourceError::InvalidPath(options.path));
        }

        Ok(Self { store, options })
    }

    fn matches(&self, key: &str) -> bool {
        if self.options.prefix {
            key.starts_with(&self.options.path)
        } else {
            key == self.options.path
        }
    }

    fn snapshot(&self) -> Vec<KeyValue> {
        self.store.read(&self.options.path, self.options.prefix)
    }
}

impl Source for MemorySource {
    type Watcher = MemorySourceWatcher;

    async fn load(&self) -> Result<Vec<KeyValue>, SourceError> {
        Ok(self.snapshot())
    }

    async fn watch(&self) -> Result<MemorySourceWatcher, SourceError> {
        Ok(MemorySourceWatcher {
            changes: self.store.changes.subscribe(),
            source: self.clone(),
            stopped: false,
        })
    }
}

/// Watcher returned by [`MemorySource::watch`].
#[derive(Debug)]
pub struct MemorySourceWatcher {
    source: MemorySource,
    changes: broadcast::Receiver<String>,
    stopped: bool,
}

impl SourceWatcher for MemorySourceWatcher {
    async fn next(&mut self) -> Result<Vec<KeyValue>, SourceError> {
        loop {
            if self.stopped {
                return Err(SourceError::Stopped);
            }

            match self.changes.recv().await {
                Ok(key) if self.source.matches(&key) => return Ok(self.source.snapshot()),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(path = %self.source.options.path, "missed {skipped} changes, reloading");
                    return Ok(self.source.snapshot());
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SourceError::Stopped),
            }
        }
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        self.stopped = true;
        Ok(())
    }
}
