//! Broker metrics for monitoring calls.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Metrics for broker operations.
pub struct BrokerMetrics {
    // Call metrics
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    validation_failures: AtomicU64,
    abandoned_calls: AtomicU64,

    // Cache and dedup metrics
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    joined_calls: AtomicU64,

    // Transport metrics
    transport_executions: AtomicU64,
    transport_attempts: AtomicU64,

    active_calls: AtomicU64,

    // Per-tool latency tracking, keyed by "service.tool"
    tool_latencies: DashMap<String, LatencyStats>,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            abandoned_calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            joined_calls: AtomicU64::new(0),
            transport_executions: AtomicU64::new(0),
            transport_attempts: AtomicU64::new(0),
            active_calls: AtomicU64::new(0),
            tool_latencies: DashMap::new(),
        }
    }

    /// Record the start of a call.
    pub fn record_call_start(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.active_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a call that ran to completion.
    pub fn record_call_end(&self, service: &str, tool: &str, success: bool, duration_ms: u64) {
        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }

        let name = format!("{}.{}", service, tool);
        if let Some(stats) = self.tool_latencies.get(&name) {
            stats.record(duration_ms);
            return;
        }
        self.tool_latencies
            .entry(name)
            .or_insert_with(LatencyStats::new)
            .record(duration_ms);
    }

    /// A call left the broker, finished or not. Every
    /// [`record_call_start`](Self::record_call_start) is paired with one of
    /// these, including for callers that dropped their future.
    pub fn record_call_exit(&self, completed: bool) {
        self.active_calls.fetch_sub(1, Ordering::Relaxed);
        if !completed {
            self.abandoned_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller attached to an in-flight call instead of starting one.
    pub fn record_joined(&self) {
        self.joined_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// One transport execution (with all its attempts) finished.
    pub fn record_transport_execution(&self, attempts: u32) {
        self.transport_executions.fetch_add(1, Ordering::Relaxed);
        self.transport_attempts
            .fetch_add(u64::from(attempts), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            abandoned_calls: self.abandoned_calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            joined_calls: self.joined_calls.load(Ordering::Relaxed),
            transport_executions: self.transport_executions.load(Ordering::Relaxed),
            transport_attempts: self.transport_attempts.load(Ordering::Relaxed),
            active_calls: self.active_calls.load(Ordering::Relaxed),
        }
    }

    /// Latency stats for one tool.
    pub fn tool_latency(&self, service: &str, tool: &str) -> Option<LatencySnapshot> {
        self.tool_latencies
            .get(&format!("{}.{}", service, tool))
            .map(|stats| stats.snapshot())
    }

    pub fn all_tool_latencies(&self) -> Vec<(String, LatencySnapshot)> {
        self.tool_latencies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.successful_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.validation_failures.store(0, Ordering::Relaxed);
        self.abandoned_calls.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.joined_calls.store(0, Ordering::Relaxed);
        self.transport_executions.store(0, Ordering::Relaxed);
        self.transport_attempts.store(0, Ordering::Relaxed);
        // Don't reset active_calls
        self.tool_latencies.clear();
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-tool latency statistics.
pub struct LatencyStats {
    count: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyStats {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        let min = self.min_ms.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            avg_ms: if count > 0 { total / count } else { 0 },
            min_ms: if min == u64::MAX { 0 } else { min },
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub validation_failures: u64,
    /// Calls whose caller went away before the result arrived.
    pub abandoned_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub joined_calls: u64,
    pub transport_executions: u64,
    pub transport_attempts: u64,
    pub active_calls: u64,
}

impl MetricsSnapshot {
    /// Attempts beyond the first of each execution.
    pub fn retries(&self) -> u64 {
        self.transport_attempts
            .saturating_sub(self.transport_executions)
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}
