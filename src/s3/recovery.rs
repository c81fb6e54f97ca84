//! Retry policy for S3 operations
//!
//! One [`RetryPolicy`] is created per logical operation (a stat, one sub-range
//! of a read, one uploaded part). After each attempt the caller hands the
//! result to [`RetryPolicy::should_retry`], which classifies the error:
//!
//! 1. success: stop
//! 2. transient (throttling, 5xx, network, body read, or a not-yet-visible
//!    object when [`Opts::retry_when_not_found`] is set): sleep a jittered
//!    exponential backoff step and retry with the same client
//! 3. no such bucket/key: stop
//! 4. anything else while more than one client remains: drop the current
//!    client and retry with the next
//! 5. otherwise: stop
//!
//! Once a policy stops it stays stopped.
//!
//! # Example
//!
//! ```ignore
//! let mut policy = factory.policy();
//! loop {
//!     let result = policy.client().head_object(bucket, key).await;
//!     if !policy.should_retry(&cancel, &result, "stat").await {
//!         return result.map_err(|e| policy.annotate(e, "stat s3://bucket/key"));
//!     }
//! }
//! ```

use super::client::ObjectClient;
use super::metrics::{Metrics, OpProgress};
use crate::config::RetryConfig;
use crate::error::{S3Error, S3Result};
use crate::interface::Opts;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exponential backoff schedule with jitter and an overall deadline
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial: Duration,

    /// Cap on a single delay
    pub max: Duration,

    /// Growth factor per retry
    pub factor: f64,

    /// Fraction of each delay that is randomized (0.0-1.0)
    pub jitter: f64,

    /// Deadline for all retries, measured from policy creation
    pub max_retry_duration: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for BackoffConfig {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            factor: config.backoff_factor,
            jitter: config.jitter,
            max_retry_duration: Duration::from_secs(config.max_retry_duration_secs),
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `retries` (0-based), without jitter
    pub fn base_delay(&self, retries: u32) -> Duration {
        let exp = self.factor.powi(retries.min(i32::MAX as u32) as i32);
        let secs = self.initial.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before retry number `retries`, with jitter applied
    ///
    /// The result lies in `[base * (1 - jitter), base)`.
    pub fn delay(&self, retries: u32) -> Duration {
        let base = self.base_delay(retries);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter;
        let fixed = base.as_secs_f64() - spread;
        let random = rand::rng().random_range(0.0..spread);
        Duration::from_secs_f64(fixed + random)
    }
}

/// Per-operation retry state
pub struct RetryPolicy {
    clients: Vec<Arc<dyn ObjectClient>>,
    backoff: BackoffConfig,
    opts: Opts,
    start: Instant,
    deadline: Instant,
    retries: u32,
    stopped: bool,
    canceled: bool,
    deadline_exceeded: bool,
    progress: Option<OpProgress>,
}

impl RetryPolicy {
    /// Create a policy over interchangeable clients
    pub fn new(
        clients: Vec<Arc<dyn ObjectClient>>,
        backoff: BackoffConfig,
        opts: Opts,
    ) -> S3Result<Self> {
        if clients.is_empty() {
            return Err(S3Error::Invalid(
                "retry policy needs at least one client".to_string(),
            ));
        }
        let start = Instant::now();
        Ok(Self {
            deadline: start + backoff.max_retry_duration,
            clients,
            backoff,
            opts,
            start,
            retries: 0,
            stopped: false,
            canceled: false,
            deadline_exceeded: false,
            progress: None,
        })
    }

    /// The client to use for the next attempt
    pub fn client(&self) -> Arc<dyn ObjectClient> {
        Arc::clone(&self.clients[0])
    }

    /// Clients not yet dropped by step 4
    pub fn remaining_clients(&self) -> usize {
        self.clients.len()
    }

    /// Number of backoff waits taken so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn opts(&self) -> Opts {
        self.opts
    }

    /// Count `n` bytes moved by the tracked operation
    pub fn record_bytes(&self, n: usize) {
        if let Some(progress) = &self.progress {
            progress.add_bytes(n as u64);
        }
    }

    /// Decide whether the operation that produced `result` should run again
    pub async fn should_retry<T>(
        &mut self,
        cancel: &CancellationToken,
        result: &S3Result<T>,
        label: &str,
    ) -> bool {
        let err = match result {
            Ok(_) => return false,
            Err(err) => err,
        };
        if self.stopped {
            return false;
        }
        if err.is_canceled() || cancel.is_cancelled() {
            self.canceled = cancel.is_cancelled();
            return self.stop();
        }

        if err.is_transient() || (self.opts.retry_when_not_found && is_missing_object(err)) {
            return self.wait(cancel, err, label).await;
        }

        if err.is_not_exist() {
            return self.stop();
        }

        if self.clients.len() > 1 {
            debug!(
                label,
                error = %err,
                remaining = self.clients.len() - 1,
                "dropping client after error"
            );
            self.clients.remove(0);
            return true;
        }

        self.stop()
    }

    /// Wrap the final error of the operation with retry details
    ///
    /// If the policy gave up because the caller canceled during a backoff
    /// wait, the returned error is a cancellation that mentions `err`.
    pub fn annotate(&self, err: S3Error, context: impl Into<String>) -> S3Error {
        let mut context = context.into();
        if self.deadline_exceeded {
            context.push_str(&format!(
                " (retry deadline of {:?} exceeded)",
                self.backoff.max_retry_duration
            ));
        }
        let ids = err.request_ids().cloned().unwrap_or_default();
        let source = if self.canceled && !err.is_canceled() {
            S3Error::Canceled(format!("canceled while retrying: {}", err))
        } else {
            err
        };
        S3Error::Annotated {
            context,
            source: Box::new(source),
            ids,
            retries: self.retries,
            elapsed: self.elapsed(),
        }
    }

    fn stop(&mut self) -> bool {
        self.stopped = true;
        false
    }

    async fn wait(&mut self, cancel: &CancellationToken, err: &S3Error, label: &str) -> bool {
        let delay = self.backoff.delay(self.retries);
        if Instant::now() + delay > self.deadline {
            self.deadline_exceeded = true;
            return self.stop();
        }

        debug!(
            label,
            error = %err,
            retries = self.retries,
            delay_ms = delay.as_millis() as u64,
            "retrying after transient error"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.canceled = true;
                self.stop()
            }
            _ = sleep(delay) => {
                self.retries += 1;
                if let Some(progress) = &mut self.progress {
                    progress.retry();
                }
                true
            }
        }
    }
}

fn is_missing_object(err: &S3Error) -> bool {
    matches!(err.code(), Some("NoSuchKey") | Some("NotFound")) || matches!(err, S3Error::NotFound(_))
}

/// Creates a fresh [`RetryPolicy`] per operation over a shared client list
#[derive(Clone)]
pub struct PolicyFactory {
    clients: Vec<Arc<dyn ObjectClient>>,
    backoff: BackoffConfig,
    opts: Opts,
    metrics: Arc<Metrics>,
}

impl PolicyFactory {
    pub fn new(
        clients: Vec<Arc<dyn ObjectClient>>,
        backoff: BackoffConfig,
        opts: Opts,
    ) -> S3Result<Self> {
        if clients.is_empty() {
            return Err(S3Error::Invalid(
                "no S3 clients available for request".to_string(),
            ));
        }
        Ok(Self {
            clients,
            backoff,
            opts,
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Report tracked operations into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// A factory over `client` alone, sharing backoff, opts and metrics
    ///
    /// Multipart uploads pin the client that created the upload so that
    /// parts, completion and abort all go to the same endpoint.
    pub fn pinned(&self, client: Arc<dyn ObjectClient>) -> Self {
        Self {
            clients: vec![client],
            backoff: self.backoff.clone(),
            opts: self.opts,
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// A policy whose retries, duration and bytes count towards `op`
    pub fn policy_for(&self, op: &str) -> RetryPolicy {
        let mut policy = self.policy();
        policy.progress = Some(self.metrics.op(op).start());
        policy
    }

    pub fn policy(&self) -> RetryPolicy {
        let start = Instant::now();
        RetryPolicy {
            clients: self.clients.clone(),
            backoff: self.backoff.clone(),
            opts: self.opts,
            start,
            deadline: start + self.backoff.max_retry_duration,
            retries: 0,
            stopped: false,
            canceled: false,
            deadline_exceeded: false,
            progress: None,
        }
    }

    pub fn clients(&self) -> &[Arc<dyn ObjectClient>] {
        &self.clients
    }

    pub fn opts(&self) -> Opts {
        self.opts
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

/// Run `fut` unless `cancel` fires first
pub async fn with_cancel<T, F>(cancel: &CancellationToken, label: &str, fut: F) -> S3Result<T>
where
    F: Future<Output = S3Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(S3Error::Canceled(label.to_string())),
        result = fut => result,
    }
}
