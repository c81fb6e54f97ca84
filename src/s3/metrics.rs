/*!
 * Per-operation S3 metrics
 *
 * Every tracked operation (a stat, one sub-range of a read, one uploaded
 * part, one listing page) bumps a call counter, and when it ends records
 * its retry count and duration into coarse buckets and the bytes it moved.
 * [`Metrics::spawn_logger`] logs the per-minute rates of every operation
 * and resets the counters each period.
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Lower bounds of the retry buckets: 1, 2-3, 4-7, 8+
const RETRY_BOUNDS: [u32; 4] = [1, 2, 4, 8];

/// Lower bounds (exclusive) of the duration buckets after the "fast" one
const DURATION_BOUNDS: [Duration; 6] = [
    Duration::from_millis(1),
    Duration::from_millis(10),
    Duration::from_millis(100),
    Duration::from_secs(1),
    Duration::from_secs(10),
    Duration::from_secs(100),
];

/// Counters of one operation name
#[derive(Debug, Default)]
pub struct OpMetrics {
    count: AtomicU64,
    retries: [AtomicU64; 4],
    durations: [AtomicU64; 7],
    bytes: AtomicU64,
}

impl OpMetrics {
    /// Count a new call and track it until the returned guard drops
    pub fn start(self: &Arc<Self>) -> OpProgress {
        self.count.fetch_add(1, Ordering::Relaxed);
        OpProgress {
            op: Arc::clone(self),
            start: Instant::now(),
            retries: 0,
        }
    }

    pub fn snapshot(&self) -> OpSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        OpSnapshot {
            count: load(&self.count),
            retries: [
                load(&self.retries[0]),
                load(&self.retries[1]),
                load(&self.retries[2]),
                load(&self.retries[3]),
            ],
            durations: [
                load(&self.durations[0]),
                load(&self.durations[1]),
                load(&self.durations[2]),
                load(&self.durations[3]),
                load(&self.durations[4]),
                load(&self.durations[5]),
                load(&self.durations[6]),
            ],
            bytes: load(&self.bytes),
        }
    }
}

/// One in-flight call; records retries and duration on drop
#[derive(Debug)]
pub struct OpProgress {
    op: Arc<OpMetrics>,
    start: Instant,
    retries: u32,
}

impl OpProgress {
    pub fn retry(&mut self) {
        self.retries += 1;
    }

    pub fn add_bytes(&self, n: u64) {
        self.op.bytes.fetch_add(n, Ordering::Relaxed);
    }
}

impl Drop for OpProgress {
    fn drop(&mut self) {
        if let Some(bucket) = RETRY_BOUNDS.iter().rposition(|b| self.retries >= *b) {
            self.op.retries[bucket].fetch_add(1, Ordering::Relaxed);
        }
        let took = self.start.elapsed();
        let bucket = DURATION_BOUNDS
            .iter()
            .rposition(|b| took > *b)
            .map_or(0, |i| i + 1);
        self.op.durations[bucket].fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of an operation's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpSnapshot {
    /// Calls started
    pub count: u64,

    /// Finished calls that retried 1, 2-3, 4-7 and 8+ times
    pub retries: [u64; 4],

    /// Finished calls that took <=1ms, >1ms, >10ms, >100ms, >1s, >10s, >100s
    pub durations: [u64; 7],

    pub bytes: u64,
}

impl OpSnapshot {
    /// Rates per minute over a collection period of `period`
    pub fn per_minute(&self, period: Duration) -> PerMinute<'_> {
        PerMinute {
            snapshot: self,
            period,
        }
    }
}

/// Log rendering of an [`OpSnapshot`] as per-minute rates
pub struct PerMinute<'a> {
    snapshot: &'a OpSnapshot,
    period: Duration,
}

impl fmt::Display for PerMinute<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scale = 60.0 / self.period.as_secs_f64().max(f64::EPSILON);
        let rate = |v: u64| (v as f64 * scale) as u64;
        let join = |values: &[u64]| {
            values
                .iter()
                .map(|v| rate(*v).to_string())
                .collect::<Vec<_>>()
                .join("/")
        };
        let s = self.snapshot;
        write!(
            f,
            "n:{} r:{} t:{} mib:{} [/min]",
            rate(s.count),
            join(&s.retries),
            join(&s.durations),
            (s.bytes as f64 / (1u64 << 20) as f64 * scale) as u64
        )
    }
}

/// Registry of per-operation counters, shared by every handle of an implementation
#[derive(Debug, Default)]
pub struct Metrics {
    ops: Mutex<BTreeMap<String, Arc<OpMetrics>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `name`, created on first use
    pub fn op(&self, name: &str) -> Arc<OpMetrics> {
        let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(ops.entry(name.to_string()).or_default())
    }

    pub fn snapshot(&self) -> BTreeMap<String, OpSnapshot> {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, op)| (name.clone(), op.snapshot()))
            .collect()
    }

    /// Snapshot and reset every operation
    ///
    /// Calls still in flight report into the detached counters and are lost.
    pub fn take(&self) -> BTreeMap<String, OpSnapshot> {
        let ops = std::mem::take(&mut *self.ops.lock().unwrap_or_else(PoisonError::into_inner));
        ops.into_iter()
            .map(|(name, op)| (name, op.snapshot()))
            .collect()
    }

    /// Log and reset the counters every `period` until `cancel` fires
    pub fn spawn_logger(
        self: Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                for (op, snapshot) in self.take() {
                    info!(op = %op, "s3file metrics: {}", snapshot.per_minute(period));
                }
            }
        })
    }
}
