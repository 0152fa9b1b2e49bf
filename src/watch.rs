//! Resilient registry subscription.
//!
//! [`WatchAdapter`] turns a registry [`Watcher`] into an endless, cancellable
//! sequence of instance lists. Transport failures are retried with bounded
//! exponential backoff; the caller only sees an error once retries run out or
//! the registry rejects the watch outright.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, RegistryError, Result};
use crate::registry::{Registry, ServiceInstance, Watcher};

/// Retry schedule for re-opening a failed watch.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay ceiling of the first retry.
    pub base: Duration,

    /// Upper bound of any single delay.
    pub max: Duration,

    /// Growth factor between consecutive ceilings.
    pub factor: u32,

    /// Consecutive failures tolerated before the error is surfaced.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2,
            max_retries: 5,
        }
    }
}

/// Backoff state for one run of consecutive failures.
#[derive(Debug)]
pub(crate) struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Ceiling of the delay for the current attempt.
    fn ceiling(&self) -> Duration {
        let growth = self.config.factor.max(1).saturating_pow(self.attempt);
        self.config.base.saturating_mul(growth).min(self.config.max)
    }

    /// Returns the next delay, or `None` once retries are exhausted.
    ///
    /// Delays are drawn uniformly from `[ceiling / 2, ceiling]`.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }

        let ceiling = self.ceiling();
        self.attempt += 1;
        let half = ceiling / 2;
        Some(half + rand::thread_rng().gen_range(Duration::ZERO..=ceiling - half))
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Timeouts and retry policy of a [`WatchAdapter`].
#[derive(Clone, Debug)]
pub struct WatchOptions {
    /// Bound on each attempt to open the watch.
    pub timeout: Duration,

    /// Bound on each wait for the next batch; `None` waits indefinitely.
    pub receive_timeout: Option<Duration>,

    /// Retry schedule.
    pub backoff: BackoffConfig,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            receive_timeout: None,
            backoff: BackoffConfig::default(),
        }
    }
}

/// One logical, self-healing subscription to a service.
///
/// Not restartable: once stopped, [`WatchAdapter::next_batch`] always
/// returns [`Error::Closed`].
pub struct WatchAdapter<R: Registry> {
    registry: Arc<R>,
    service: String,
    options: WatchOptions,
    watcher: Option<R::Watcher>,
    backoff: Backoff,
    cooldown: bool,
    cancel: CancellationToken,
}

impl<R: Registry> WatchAdapter<R> {
    /// Opens the initial watch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubscriptionFailed`] if the registry refuses or does
    /// not answer within [`WatchOptions::timeout`], and [`Error::Closed`] if
    /// `cancel` fires first.
    pub async fn subscribe(
        registry: Arc<R>,
        service: impl Into<String>,
        options: WatchOptions,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let service = service.into();
        let watcher = match open(&*registry, &service, options.timeout, &cancel).await {
            Ok(watcher) => watcher,
            Err(_) if cancel.is_cancelled() => return Err(Error::Closed),
            Err(source) => return Err(Error::SubscriptionFailed { service, source }),
        };

        tracing::debug!(service = %service, "registry watch opened");

        Ok(Self {
            registry,
            backoff: Backoff::new(options.backoff.clone()),
            service,
            options,
            watcher: Some(watcher),
            cooldown: false,
            cancel,
        })
    }

    /// Token that stops this adapter when cancelled.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the next instance list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WatchTransport`] when retries are exhausted or the
    /// registry rejects the watch, and [`Error::Closed`] once stopped. After a
    /// transport error the next call waits [`BackoffConfig::max`] and starts a
    /// fresh retry cycle.
    pub async fn next_batch(&mut self) -> Result<Vec<ServiceInstance>> {
        if self.cooldown {
            self.cooldown = false;
            pause(&self.cancel, self.options.backoff.max).await?;
        }

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Closed);
            }

            let err = if let Some(watcher) = self.watcher.as_mut() {
                match receive(watcher, self.options.receive_timeout, &self.cancel).await {
                    Ok(batch) => {
                        self.backoff.reset();
                        return Ok(batch);
                    }

                    Err(err) => err,
                }
            } else {
                match open(&*self.registry, &self.service, self.options.timeout, &self.cancel).await {
                    Ok(watcher) => {
                        tracing::debug!(service = %self.service, "registry watch re-opened");
                        self.watcher = Some(watcher);
                        continue;
                    }

                    Err(err) => err,
                }
            };

            if self.cancel.is_cancelled() {
                return Err(Error::Closed);
            }

            self.release();
            if !err.is_transient() {
                return Err(self.surface(err));
            }

            let Some(delay) = self.backoff.next_delay() else {
                return Err(self.surface(err));
            };

            tracing::warn!(
                service = %self.service,
                "registry watch failed, retrying in {delay:?}: {err}"
            );

            pause(&self.cancel, delay).await?;
        }
    }

    /// Stops the adapter and releases the subscription. Idempotent.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.release();
    }

    fn surface(&mut self, source: RegistryError) -> Error {
        self.backoff.reset();
        self.cooldown = true;
        Error::WatchTransport {
            service: self.service.clone(),
            source,
        }
    }

    fn release(&mut self) {
        if let Some(mut watcher) = self.watcher.take()
            && let Err(e) = watcher.stop()
        {
            tracing::warn!(service = %self.service, "failed to stop registry watcher: {e}");
        }
    }
}

impl<R: Registry> Drop for WatchAdapter<R> {
    fn drop(&mut self) {
        self.release();
    }
}

async fn pause(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Closed),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

async fn open<R: Registry>(
    registry: &R,
    service: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> std::result::Result<R::Watcher, RegistryError> {
    tokio::select! {
        () = cancel.cancelled() => Err(RegistryError::Stopped),
        result = tokio::time::timeout(timeout, registry.watch(service)) => {
            result.unwrap_or(Err(RegistryError::Timeout(timeout)))
        }
    }
}

async fn receive<W: Watcher>(
    watcher: &mut W,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> std::result::Result<Vec<ServiceInstance>, RegistryError> {
    let next = async {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, watcher.next())
                .await
                .unwrap_or(Err(RegistryError::Timeout(timeout))),
            None => watcher.next().await,
        }
    };

    tokio::select! {
        () = cancel.cancelled() => Err(RegistryError::Stopped),
        result = next => result,
    }
}
