//! Per-call node selection over the current snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::balancer::Balancer;
use crate::error::{Error, Result};
use crate::filter::{FilterChain, NodeFilter};
use crate::node::{Directory, Node, Outcome};

/// Chooses a node for each outgoing call and accepts feedback afterwards.
///
/// Cloning is cheap; clones share the directory, filters, balancer and closed
/// flag.
#[derive(Clone, Debug)]
pub struct Selector {
    directory: Arc<Directory>,
    filters: FilterChain,
    balancer: Arc<dyn Balancer>,
    closed: Arc<AtomicBool>,
}

impl Selector {
    /// Creates a selector reading from `directory`.
    #[must_use]
    pub fn new(directory: Arc<Directory>, filters: FilterChain, balancer: Arc<dyn Balancer>) -> Self {
        Self {
            directory,
            filters,
            balancer,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Selects a node and reserves it for one call.
    ///
    /// The caller should pass the result of the call to [`Selector::report`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`Selector::close`], and
    /// [`Error::NoAvailableNode`] if nothing is published or every node is
    /// filtered out.
    pub fn select(&self) -> Result<Arc<Node>> {
        self.select_with(&[])
    }

    /// Like [`Selector::select`], applying `extra` filters after the
    /// configured ones.
    ///
    /// # Errors
    ///
    /// Same as [`Selector::select`].
    pub fn select_with(&self, extra: &[NodeFilter]) -> Result<Arc<Node>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let snapshot = self.directory.get().ok_or(Error::NoAvailableNode)?;
        let mut candidates = self.filters.apply(&snapshot);
        if !extra.is_empty() {
            candidates.retain(|node| extra.iter().all(|f| f(node)));
        }

        let node = match candidates.len() {
            0 => return Err(Error::NoAvailableNode),
            1 => candidates.swap_remove(0),
            _ => self.balancer.pick(&candidates),
        };

        node.begin();
        Ok(node)
    }

    /// Records the outcome of a call made to `node`.
    ///
    /// Reports are applied even after close so calls in flight at shutdown
    /// still release their reservation.
    pub fn report(&self, node: &Node, outcome: Outcome) {
        self.balancer.report(node, outcome);
    }

    /// Makes every later [`Selector::select`] fail with [`Error::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether [`Selector::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The directory this selector reads from.
    #[must_use]
    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }
}
