// Run metrics module
//
// Provides lightweight counters for the pipeline stages and external tool time

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters collected over one run
///
/// Uses atomic operations so worker tasks can record without locks.
#[derive(Debug)]
pub struct Metrics {
    /// Images decoded by the codec during this run
    pub images_extracted: AtomicUsize,

    /// Images whose workspace already existed
    pub extract_cache_hits: AtomicUsize,

    /// Mapping workspaces that already existed
    pub stage_cache_hits: AtomicUsize,

    /// Mappings that produced an output container
    pub mappings_created: AtomicUsize,

    /// Mappings that failed at any stage
    pub mappings_failed: AtomicUsize,

    /// Patch entries that failed but were tolerated
    pub entries_tolerated: AtomicUsize,

    /// Total time spent waiting on external tools, in milliseconds
    pub tool_time_ms: AtomicU64,

    /// Number of external tool invocations
    pub tool_invocations: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            images_extracted: AtomicUsize::new(0),
            extract_cache_hits: AtomicUsize::new(0),
            stage_cache_hits: AtomicUsize::new(0),
            mappings_created: AtomicUsize::new(0),
            mappings_failed: AtomicUsize::new(0),
            entries_tolerated: AtomicUsize::new(0),
            tool_time_ms: AtomicU64::new(0),
            tool_invocations: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_image_extracted(&self) {
        self.images_extracted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_extract_cache_hit(&self) {
        self.extract_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_cache_hit(&self) {
        self.stage_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mapping_created(&self) {
        self.mappings_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mapping_failed(&self) {
        self.mappings_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_entry_tolerated(&self) {
        self.entries_tolerated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one external tool invocation and how long it took
    pub fn record_tool_time(&self, duration: Duration) {
        self.tool_invocations.fetch_add(1, Ordering::Relaxed);
        self.tool_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average tool invocation time in milliseconds
    pub fn avg_tool_time_ms(&self) -> f64 {
        let total = self.tool_time_ms.load(Ordering::Relaxed);
        let count = self.tool_invocations.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Run Metrics Summary ===");
        tracing::info!("Elapsed: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Images: {} extracted, {} cached",
            self.images_extracted.load(Ordering::Relaxed),
            self.extract_cache_hits.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Mappings: {} created, {} failed, {} staged from cache, {} patch entries tolerated",
            self.mappings_created.load(Ordering::Relaxed),
            self.mappings_failed.load(Ordering::Relaxed),
            self.stage_cache_hits.load(Ordering::Relaxed),
            self.entries_tolerated.load(Ordering::Relaxed)
        );
        tracing::info!(
            "External tools: {} invocations, {:.2}s total (avg: {:.2}ms)",
            self.tool_invocations.load(Ordering::Relaxed),
            self.tool_time_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            self.avg_tool_time_ms()
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.mappings_created.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.mappings_failed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_mapping_outcomes() {
        let metrics = Metrics::new();

        metrics.record_mapping_created();
        metrics.record_mapping_created();
        metrics.record_mapping_failed();
        metrics.record_image_extracted();
        metrics.record_extract_cache_hit();
        metrics.record_stage_cache_hit();
        metrics.record_entry_tolerated();

        assert_eq!(metrics.mappings_created.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.mappings_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.images_extracted.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.extract_cache_hits.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.stage_cache_hits.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.entries_tolerated.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_record_tool_time() {
        let metrics = Metrics::new();

        metrics.record_tool_time(Duration::from_millis(100));
        metrics.record_tool_time(Duration::from_millis(200));

        assert_eq!(metrics.tool_time_ms.load(Ordering::Relaxed), 300);
        assert_eq!(metrics.avg_tool_time_ms(), 150.0);
    }

    #[test]
    fn test_avg_tool_time_without_invocations() {
        let metrics = Metrics::new();
        assert_eq!(metrics.avg_tool_time_ms(), 0.0);
    }

    #[test]
    fn test_uptime() {
        let metrics = Metrics::new();
        thread::sleep(Duration::from_millis(10));
        assert!(metrics.uptime().as_millis() >= 10);
    }
}
