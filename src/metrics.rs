//! Process-wide metrics with rolling windows and health classification.
//!
//! Sampling never blocks the hot path: counters sit behind a short
//! `parking_lot::Mutex` critical section and percentile math happens only
//! when a summary snapshot is requested.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

const ERROR_RATE_THRESHOLD: f64 = 0.10;
const AVG_RESPONSE_THRESHOLD_MS: f64 = 5000.0;
const AVG_CONFIDENCE_THRESHOLD: f64 = 0.30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    pub last_error: Option<String>,
}

impl ProviderStats {
    pub fn avg_latency_ms(&self) -> f64 {
        if self.successes == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.successes as f64
        }
    }
}

/// Bucketed confidence distribution: high >= 0.70, medium 0.40-0.69, low < 0.40.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConfidenceBuckets {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub uptime_secs: u64,
    pub pairing_requests: u64,
    pub pairing_successes: u64,
    pub pairing_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub inventory_ops: u64,
    pub inventory_conflicts: u64,
    pub sync_applied: u64,
    pub sync_duplicates: u64,
    pub sync_rejected: u64,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub avg_confidence: f64,
    pub p50_response_ms: f64,
    pub p95_response_ms: f64,
    pub p99_response_ms: f64,
    pub confidence_buckets: ConfidenceBuckets,
    pub providers: HashMap<String, ProviderStats>,
    pub health: HealthStatus,
    pub issues: Vec<String>,
}

#[derive(Debug)]
struct MetricsInner {
    pairing_requests: u64,
    pairing_successes: u64,
    pairing_failures: u64,
    cache_hits: u64,
    cache_misses: u64,
    inventory_ops: u64,
    inventory_conflicts: u64,
    sync_applied: u64,
    sync_duplicates: u64,
    sync_rejected: u64,
    response_times_ms: VecDeque<f64>,
    confidences: VecDeque<f64>,
    providers: HashMap<String, ProviderStats>,
}

#[derive(Debug)]
pub struct MetricsTracker {
    inner: Mutex<MetricsInner>,
    window: usize,
    started_at: Instant,
}

impl MetricsTracker {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            inner: Mutex::new(MetricsInner {
                pairing_requests: 0,
                pairing_successes: 0,
                pairing_failures: 0,
                cache_hits: 0,
                cache_misses: 0,
                inventory_ops: 0,
                inventory_conflicts: 0,
                sync_applied: 0,
                sync_duplicates: 0,
                sync_rejected: 0,
                response_times_ms: VecDeque::with_capacity(window),
                confidences: VecDeque::with_capacity(window),
                providers: HashMap::new(),
            }),
            window,
            started_at: Instant::now(),
        }
    }

    fn push_window(window: usize, deque: &mut VecDeque<f64>, value: f64) {
        deque.push_back(value);
        if deque.len() > window {
            deque.pop_front();
        }
    }

    pub fn record_pairing_request(&self) {
        self.inner.lock().pairing_requests += 1;
    }

    pub fn record_pairing_success(&self, response_time_ms: f64, top_confidence: f64) {
        let mut inner = self.inner.lock();
        inner.pairing_successes += 1;
        Self::push_window(self.window, &mut inner.response_times_ms, response_time_ms);
        Self::push_window(self.window, &mut inner.confidences, top_confidence);
    }

    pub fn record_pairing_failure(&self) {
        self.inner.lock().pairing_failures += 1;
    }

    pub fn record_cache_hit(&self) {
        self.inner.lock().cache_hits += 1;
    }

    pub fn record_cache_miss(&self) {
        self.inner.lock().cache_misses += 1;
    }

    pub fn record_inventory_op(&self) {
        self.inner.lock().inventory_ops += 1;
    }

    pub fn record_inventory_conflict(&self) {
        self.inner.lock().inventory_conflicts += 1;
    }

    pub fn record_sync_outcome(&self, applied: bool, duplicate: bool) {
        let mut inner = self.inner.lock();
        if duplicate {
            inner.sync_duplicates += 1;
        } else if applied {
            inner.sync_applied += 1;
        } else {
            inner.sync_rejected += 1;
        }
    }

    pub fn record_provider_attempt(&self, provider: &str) {
        let mut inner = self.inner.lock();
        inner.providers.entry(provider.to_string()).or_default().attempts += 1;
    }

    pub fn record_provider_success(&self, provider: &str, latency_ms: u64) {
        let mut inner = self.inner.lock();
        let stats = inner.providers.entry(provider.to_string()).or_default();
        stats.successes += 1;
        stats.total_latency_ms += latency_ms;
    }

    pub fn record_provider_failure(&self, provider: &str, error: &str) {
        let mut inner = self.inner.lock();
        let stats = inner.providers.entry(provider.to_string()).or_default();
        stats.failures += 1;
        stats.last_error = Some(error.chars().take(200).collect());
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let index = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[index.min(sorted.len() - 1)]
    }

    pub fn summary(&self) -> MetricsSummary {
        let inner = self.inner.lock();

        let mut sorted: Vec<f64> = inner.response_times_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let avg_response_time_ms = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };

        let avg_confidence = if inner.confidences.is_empty() {
            // Nothing sampled yet; report a passing value so an idle server
            // is not classified degraded.
            1.0
        } else {
            inner.confidences.iter().sum::<f64>() / inner.confidences.len() as f64
        };

        let mut buckets = ConfidenceBuckets::default();
        for &c in &inner.confidences {
            if c >= 0.70 {
                buckets.high += 1;
            } else if c >= 0.40 {
                buckets.medium += 1;
            } else {
                buckets.low += 1;
            }
        }

        let error_rate = if inner.pairing_requests == 0 {
            0.0
        } else {
            inner.pairing_failures as f64 / inner.pairing_requests as f64
        };

        let mut issues = Vec::new();
        if error_rate > ERROR_RATE_THRESHOLD {
            issues.push(format!("error rate {:.1}% above 10%", error_rate * 100.0));
        }
        if avg_response_time_ms > AVG_RESPONSE_THRESHOLD_MS {
            issues.push(format!(
                "avg response time {:.0}ms above {:.0}ms",
                avg_response_time_ms, AVG_RESPONSE_THRESHOLD_MS
            ));
        }
        if avg_confidence < AVG_CONFIDENCE_THRESHOLD {
            issues.push(format!(
                "avg confidence {:.2} below {:.2}",
                avg_confidence, AVG_CONFIDENCE_THRESHOLD
            ));
        }

        let health = match issues.len() {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        };

        MetricsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            pairing_requests: inner.pairing_requests,
            pairing_successes: inner.pairing_successes,
            pairing_failures: inner.pairing_failures,
            cache_hits: inner.cache_hits,
            cache_misses: inner.cache_misses,
            inventory_ops: inner.inventory_ops,
            inventory_conflicts: inner.inventory_conflicts,
            sync_applied: inner.sync_applied,
            sync_duplicates: inner.sync_duplicates,
            sync_rejected: inner.sync_rejected,
            error_rate,
            avg_response_time_ms,
            avg_confidence,
            p50_response_ms: Self::percentile(&sorted, 0.50),
            p95_response_ms: Self::percentile(&sorted, 0.95),
            p99_response_ms: Self::percentile(&sorted, 0.99),
            confidence_buckets: buckets,
            providers: inner.providers.clone(),
            health,
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_tracker_is_healthy() {
        let tracker = MetricsTracker::new(100);
        let summary = tracker.summary();
        assert_eq!(summary.health, HealthStatus::Healthy);
        assert!(summary.issues.is_empty());
    }

    #[test]
    fn one_breach_degrades_two_unhealthy() {
        let tracker = MetricsTracker::new(100);
        for _ in 0..10 {
            tracker.record_pairing_request();
            tracker.record_pairing_failure();
        }
        // error_rate = 100% -> one breach (no samples, so confidence passes)
        assert_eq!(tracker.summary().health, HealthStatus::Degraded);

        // Add low-confidence slow samples -> three breaches
        for _ in 0..5 {
            tracker.record_pairing_success(9000.0, 0.1);
        }
        let summary = tracker.summary();
        assert_eq!(summary.health, HealthStatus::Unhealthy);
        assert!(summary.issues.len() >= 2);
    }

    #[test]
    fn window_is_bounded() {
        let tracker = MetricsTracker::new(10);
        for i in 0..50 {
            tracker.record_pairing_success(i as f64, 0.9);
        }
        let summary = tracker.summary();
        // Only the last 10 samples (40..49) remain.
        assert_eq!(summary.p50_response_ms, 44.0);
        assert_eq!(summary.confidence_buckets.high, 10);
    }

    #[test]
    fn percentiles_from_window() {
        let tracker = MetricsTracker::new(100);
        for i in 1..=100 {
            tracker.record_pairing_success(i as f64, 0.8);
        }
        let summary = tracker.summary();
        assert_eq!(summary.p50_response_ms, 50.0);
        assert_eq!(summary.p95_response_ms, 95.0);
        assert_eq!(summary.p99_response_ms, 99.0);
    }

    #[test]
    fn provider_stats_accumulate() {
        let tracker = MetricsTracker::new(100);
        tracker.record_provider_attempt("primary_ai");
        tracker.record_provider_failure("primary_ai", "timeout");
        tracker.record_provider_attempt("heuristic");
        tracker.record_provider_success("heuristic", 12);

        let summary = tracker.summary();
        assert_eq!(summary.providers["primary_ai"].failures, 1);
        assert_eq!(summary.providers["heuristic"].successes, 1);
        assert_eq!(summary.providers["heuristic"].avg_latency_ms(), 12.0);
    }
}
