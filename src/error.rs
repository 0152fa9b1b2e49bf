//! Error types shared by the resolver, the watcher adapter and the balancers.

use thiserror::Error;

/// Boxed error used to carry causes from external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for resolver and selection operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the resolver bridge and the selector.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The registry watch stream could not be re-established after retrying.
    #[error("registry watch for '{service}' failed: {source}")]
    WatchTransport {
        /// Service being watched.
        service: String,
        /// Last failure reported by the registry.
        #[source]
        source: RegistryError,
    },

    /// A service instance has no endpoint usable by the resolving transport.
    #[error("instance '{instance}' has no '{scheme}' endpoint")]
    InstanceParse {
        /// Registry ID of the offending instance.
        instance: String,
        /// Endpoint scheme that was required.
        scheme: String,
    },

    /// No node survived filtering, or nothing has been published yet.
    #[error("no backend available")]
    NoAvailableNode,

    /// The resolver has been shut down.
    #[error("resolver closed")]
    Closed,

    /// The initial registry subscription could not be opened.
    #[error("failed to subscribe to '{service}': {source}")]
    SubscriptionFailed {
        /// Service being watched.
        service: String,
        /// Failure reported by the registry.
        #[source]
        source: RegistryError,
    },

    /// No balancer factory is registered under the configured name.
    #[error("unknown balancer '{0}'")]
    UnknownBalancer(String),

    /// The build target does not name a service.
    #[error("invalid target '{0}'")]
    InvalidTarget(String),
}

/// Errors reported by registry and configuration-source collaborators.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// Connection or stream failure; the watch may be re-opened.
    #[error("transport: {0}")]
    Transport(#[source] BoxError),

    /// The registry refused the request; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The watcher has been stopped.
    #[error("watcher stopped")]
    Stopped,

    /// A wait on the registry exceeded the configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl RegistryError {
    /// Creates a transport error from any error or message.
    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }

    /// Returns `true` if re-opening the watch may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}
