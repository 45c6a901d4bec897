use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Metrics for counter operations
#[derive(Debug, Default)]
pub struct CounterMetrics {
    /// Counters created
    pub creates: AtomicU64,
    /// Successful increments
    pub increments: AtomicU64,
    /// Units removed by successful decrements
    pub decrements: AtomicU64,
    /// Decrements skipped because the aggregate was already zero
    pub noop_decrements: AtomicU64,
    /// Decrements that had to scan every shard after a random miss
    pub scan_fallbacks: AtomicU64,
    /// Decrements that found no decrementable shard despite a positive aggregate
    pub consistency_anomalies: AtomicU64,
    /// Shard indices added after creation
    pub shards_added: AtomicU64,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_create(&self) {
        self.creates.fetch_add(1, Ordering::Relaxed);
        trace!(counter_op = "create");
    }

    pub fn record_increment(&self, amount: u64) {
        self.increments.fetch_add(1, Ordering::Relaxed);
        trace!(counter_op = "increment", amount = amount);
    }

    pub fn record_decrement(&self, units: u64) {
        self.decrements.fetch_add(units, Ordering::Relaxed);
        trace!(counter_op = "decrement", units = units);
    }

    pub fn record_noop_decrement(&self) {
        self.noop_decrements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan_fallback(&self) {
        self.scan_fallbacks.fetch_add(1, Ordering::Relaxed);
        trace!(counter_op = "scan_fallback");
    }

    pub fn record_consistency_anomaly(&self) {
        self.consistency_anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shards_added(&self, count: u32) {
        self.shards_added.fetch_add(u64::from(count), Ordering::Relaxed);
        debug!(counter_op = "add_shards", count = count);
    }

    /// Log a summary of counter metrics
    pub fn log_summary(&self, elapsed_secs: f64) {
        let increments = self.increments.load(Ordering::Relaxed);
        let throughput = if elapsed_secs > 0.0 {
            increments as f64 / elapsed_secs
        } else {
            0.0
        };

        info!(
            operation = "counter_metrics_summary",
            creates = self.creates.load(Ordering::Relaxed),
            increments = increments,
            decremented_units = self.decrements.load(Ordering::Relaxed),
            noop_decrements = self.noop_decrements.load(Ordering::Relaxed),
            scan_fallbacks = self.scan_fallbacks.load(Ordering::Relaxed),
            consistency_anomalies = self.consistency_anomalies.load(Ordering::Relaxed),
            shards_added = self.shards_added.load(Ordering::Relaxed),
            increments_per_sec = throughput,
            duration_secs = elapsed_secs,
        );
    }
}

/// Metrics for the cached aggregate
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Reads answered from the cache
    pub hits: AtomicU64,
    /// Reads that fell through to the shards
    pub misses: AtomicU64,
    /// Aggregates rebuilt by summing shards
    pub reconstructions: AtomicU64,
    /// Compare-and-swap attempts that lost a race
    pub cas_conflicts: AtomicU64,
    /// Adjustments skipped because the aggregate was not cached
    pub adjust_missing: AtomicU64,
    /// Adjustments that ran out of attempts and evicted the aggregate
    pub cas_exhausted: AtomicU64,
    /// Cache operations that failed outright
    pub errors: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconstruction(&self, num_shards: u32) {
        self.reconstructions.fetch_add(1, Ordering::Relaxed);
        trace!(cache_op = "reconstruct", num_shards = num_shards);
    }

    pub fn record_cas_conflict(&self) {
        self.cas_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_adjust_missing(&self) {
        self.adjust_missing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cas_exhausted(&self) {
        self.cas_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        (hits as f64 / total as f64) * 100.0
    }

    /// Log a summary of cache metrics
    pub fn log_summary(&self) {
        let exhausted = self.cas_exhausted.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);

        info!(
            operation = "cache_metrics_summary",
            hits = self.hits.load(Ordering::Relaxed),
            misses = self.misses.load(Ordering::Relaxed),
            hit_rate_pct = self.hit_rate(),
            reconstructions = self.reconstructions.load(Ordering::Relaxed),
            cas_conflicts = self.cas_conflicts.load(Ordering::Relaxed),
            adjust_missing = self.adjust_missing.load(Ordering::Relaxed),
            cas_exhausted = exhausted,
            errors = errors,
        );

        if exhausted > 0 || errors > 0 {
            warn!(
                cas_exhausted = exhausted,
                errors = errors,
                "Cached aggregates were dropped; reads will rebuild them from shards"
            );
        }
    }
}

/// Metrics for the asynchronous deletion pipeline
#[derive(Debug, Default)]
pub struct DeletionMetrics {
    pub jobs_enqueued: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub job_retries: AtomicU64,
    /// Jobs put back for a later delivery after exhausting their attempts
    pub jobs_redelivered: AtomicU64,
    /// Shard records removed by completed jobs
    pub shards_purged: AtomicU64,
}

impl DeletionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self, queue: &str) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        trace!(deletion_op = "enqueue", queue = queue);
    }

    pub fn record_completed(&self, shards: u32) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.shards_purged
            .fetch_add(u64::from(shards), Ordering::Relaxed);
        trace!(deletion_op = "completed", shards = shards);
    }

    pub fn record_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self, counter: &str, attempt: u32) {
        self.job_retries.fetch_add(1, Ordering::Relaxed);
        debug!(deletion_op = "retry", counter = counter, attempt = attempt);
    }

    pub fn record_redelivered(&self, counter: &str) {
        self.jobs_redelivered.fetch_add(1, Ordering::Relaxed);
        debug!(deletion_op = "redeliver", counter = counter);
    }

    /// Jobs enqueued but not yet completed or abandoned
    pub fn pending(&self) -> u64 {
        let enqueued = self.jobs_enqueued.load(Ordering::Relaxed);
        let done = self.jobs_completed.load(Ordering::Relaxed)
            + self.jobs_failed.load(Ordering::Relaxed);
        enqueued.saturating_sub(done)
    }

    pub fn log_summary(&self) {
        info!(
            operation = "deletion_metrics_summary",
            enqueued = self.jobs_enqueued.load(Ordering::Relaxed),
            completed = self.jobs_completed.load(Ordering::Relaxed),
            failed = self.jobs_failed.load(Ordering::Relaxed),
            retries = self.job_retries.load(Ordering::Relaxed),
            redelivered = self.jobs_redelivered.load(Ordering::Relaxed),
            shards_purged = self.shards_purged.load(Ordering::Relaxed),
            pending = self.pending(),
        );
    }
}

/// Combined metrics for the entire system
pub struct Metrics {
    pub counters: Arc<CounterMetrics>,
    pub cache: Arc<CacheMetrics>,
    pub deletion: Arc<DeletionMetrics>,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(CounterMetrics::new()),
            cache: Arc::new(CacheMetrics::new()),
            deletion: Arc::new(DeletionMetrics::new()),
            start_time: Instant::now(),
        }
    }

    /// Log a complete metrics summary
    pub fn log_full_summary(&self) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        info!("=== sharded-counter Metrics Summary ===");
        self.counters.log_summary(elapsed);
        self.cache.log_summary();
        self.deletion.log_summary();
        info!("=======================================");
    }

    /// Log periodic metrics summary (for background task)
    pub fn log_periodic(&self) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        info!("--- sharded-counter Metrics (periodic) ---");
        self.counters.log_summary(elapsed);
        self.cache.log_summary();
        self.deletion.log_summary();
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Create a periodic logging background task
    pub fn spawn_periodic_logging(
        self: &Arc<Self>,
        interval_secs: u64,
        stop: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if stop.load(Ordering::Relaxed) {
                    break;
                }

                metrics.log_periodic();
            }
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
