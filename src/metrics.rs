use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LATENCY_WINDOW: usize = 1000;

/// Sliding window of per-call latencies in nanoseconds
#[derive(Debug, Clone)]
struct LatencyWindow {
    samples: Arc<Mutex<VecDeque<u64>>>,
    capacity: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn record(&self, nanos: u64) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(nanos);
    }

    /// Percentiles in microseconds, in the order requested
    fn percentiles_us<const N: usize>(&self, points: [f64; N]) -> [f64; N] {
        let mut sorted: Vec<u64> = self.samples.lock().iter().copied().collect();
        let mut out = [0.0; N];
        if sorted.is_empty() {
            return out;
        }
        sorted.sort_unstable();
        for (slot, p) in out.iter_mut().zip(points) {
            let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
            *slot = sorted[idx] as f64 / 1000.0;
        }
        out
    }
}

/// Counters shared by all workers of one stage
#[derive(Debug, Clone)]
pub struct StageMetrics {
    /// Units of work taken from the input (items, or batches for fan-in)
    consumed: Arc<AtomicU64>,
    /// Results pushed to the output queue
    emitted: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    latency: LatencyWindow,
    started: Instant,
}

impl StageMetrics {
    /// Create empty metrics; throughput is measured from now
    pub fn new() -> Self {
        Self {
            consumed: Arc::new(AtomicU64::new(0)),
            emitted: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            latency: LatencyWindow::new(LATENCY_WINDOW),
            started: Instant::now(),
        }
    }

    /// Record one unit of work taken from the input queue
    pub fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one result pushed to the output queue
    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fatal worker error
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Time spent in one call of the stage function, including pushes of its results
    pub fn record_latency(&self, elapsed: Duration) {
        self.latency.record(elapsed.as_nanos() as u64);
    }

    /// Units of work consumed so far
    pub fn total_consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Results emitted so far
    pub fn total_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Failures recorded so far
    pub fn total_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Results emitted per second since the stage started
    pub fn throughput(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.total_emitted() as f64 / secs
        }
    }

    /// Copy the current counters and latency percentiles
    pub fn snapshot(&self) -> MetricsSnapshot {
        let [p50, p95, p99] = self.latency.percentiles_us([0.50, 0.95, 0.99]);
        MetricsSnapshot {
            consumed: self.total_consumed(),
            emitted: self.total_emitted(),
            failures: self.total_failures(),
            throughput: self.throughput(),
            latency_p50_us: p50,
            latency_p95_us: p95,
            latency_p99_us: p99,
            elapsed: self.started.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a stage's metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub consumed: u64,
    pub emitted: u64,
    pub failures: u64,
    pub throughput: f64,
    pub latency_p50_us: f64,
    pub latency_p95_us: f64,
    pub latency_p99_us: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Render the snapshot as one human-readable line
    pub fn format(&self) -> String {
        format!(
            "Consumed: {}, Emitted: {}, Failures: {}, Throughput: {:.2} items/s, \
             Latency P50: {:.2}µs, P95: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.consumed,
            self.emitted,
            self.failures,
            self.throughput,
            self.latency_p50_us,
            self.latency_p95_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}
