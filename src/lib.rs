#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Registry-driven endpoint resolution and power-of-two-choices load balancing
//! for [Tonic](https://docs.rs/tonic) gRPC clients.
//!
//! A long-lived HTTP/2 connection pins every request to one backend unless the
//! client balances across backends itself. This crate keeps a live view of the
//! healthy instances of a service, published by a service [`Registry`], and
//! chooses which instance receives each call.
//!
//! # Features
//!
//! - **Resilient watch**: registry subscriptions are re-opened with bounded,
//!   jittered backoff; failures degrade to the last good view
//! - **Race-free directory**: every registry change is published as an
//!   immutable snapshot; selection never blocks on updates
//! - **Adaptive selection**: P2C with EWMA latency and outstanding request
//!   feedback, plus `random` and `round_robin` policies
//! - **Filters**: version, metadata or arbitrary predicates applied per call
//! - **Tonic integration**: feed `Channel::balance_channel` through
//!   [`BalanceChannelSink`]
//! - **Kubernetes** (feature `kubernetes`): `EndpointSlice` backed registry
//!
//! # Usage
//!
//! ```ignore
//! use std::time::{Duration, Instant};
//! use tonic_lb_discovery::{MemoryRegistry, Outcome, ResolverBuilder, ResolverConfig, ServiceInstance};
//!
//! let registry = MemoryRegistry::new();
//! registry.register(ServiceInstance::new("a", "greeter").endpoint("grpc://10.0.0.1:9000"));
//!
//! let resolver = ResolverBuilder::new(registry)
//!     .build("discovery:///greeter", (), ResolverConfig::new().insecure(true))
//!     .await?;
//! resolver.ready().await?;
//!
//! let node = resolver.select()?;
//! let start = Instant::now();
//! // ... call node.address() ...
//! resolver.report(&node, Outcome::Success(start.elapsed()));
//! ```

mod balancer;
mod direct;
mod error;
pub mod filter;
#[cfg(feature = "kubernetes")]
mod k8s;
mod node;
mod p2c;
mod registry;
mod resolver;
mod selector;
mod sink;
pub mod source;
#[cfg(test)]
mod testing;
mod watch;

pub use balancer::{Balancer, BalancerFactory, Balancers, P2C, RANDOM, ROUND_ROBIN, Random, RoundRobin};
pub use direct::{DIRECT_SCHEME, DirectBuilder};
pub use error::{BoxError, Error, RegistryError, Result};
pub use filter::{FilterChain, NodeFilter};
#[cfg(feature = "kubernetes")]
pub use k8s::{KubernetesRegistry, KubernetesWatcher, Port};
pub use node::{DEFAULT_WEIGHT, Directory, Node, Outcome, Snapshot, Stats, WEIGHT_KEY};
pub use p2c::{P2c, P2cConfig};
pub use registry::{MemoryRegistry, MemoryWatcher, Registry, ServiceInstance, Watcher};
pub use resolver::{Resolver, ResolverBuilder, ResolverConfig, ResolverState, SCHEME};
pub use selector::Selector;
pub use sink::{BalanceChannelSink, SinkClosed, UpdateSink};
pub use watch::{BackoffConfig, WatchAdapter, WatchOptions};
