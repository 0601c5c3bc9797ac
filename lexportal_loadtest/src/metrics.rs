//! Metrics tracking for load-test requests
//!
//! Tracks status counts, ban observations, and latency percentiles.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// What a single response told us about the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Request went through to the API
    Passed,
    /// 429 whose body carries the ban message
    Banned,
    /// 429 without the ban message
    UnexplainedRejection,
}

/// Metrics tracker shared by all virtual users
pub struct Metrics {
    inner: RwLock<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    total_requests: u64,
    transport_errors: u64,
    statuses: BTreeMap<u16, u64>,

    probes_passed: u64,
    probes_banned: u64,
    ban_checks_failed: u64,

    health_allowed: u64,
    health_blocked: u64,

    /// Latencies in microseconds
    durations: Vec<u64>,
}

/// Snapshot of current metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub transport_errors: u64,
    pub statuses: BTreeMap<u16, u64>,
    pub probes_passed: u64,
    pub probes_banned: u64,
    pub ban_checks_failed: u64,
    pub health_allowed: u64,
    pub health_blocked: u64,
    pub avg_duration_ms: f64,
    pub p50_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MetricsInner::default()),
        }
    }

    /// Record a probe response
    pub async fn record_probe(&self, status: u16, observation: Observation, duration: Duration) {
        let mut inner = self.inner.write().await;
        inner.record_response(status, duration);
        match observation {
            Observation::Passed => inner.probes_passed += 1,
            Observation::Banned => inner.probes_banned += 1,
            Observation::UnexplainedRejection => inner.ban_checks_failed += 1,
        }
    }

    /// Record a health-check response
    pub async fn record_health(&self, status: u16, observation: Observation, duration: Duration) {
        let mut inner = self.inner.write().await;
        inner.record_response(status, duration);
        match observation {
            Observation::Passed => inner.health_allowed += 1,
            Observation::Banned => inner.health_blocked += 1,
            Observation::UnexplainedRejection => {
                inner.health_blocked += 1;
                inner.ban_checks_failed += 1;
            }
        }
    }

    /// Record a request that never produced a response
    pub async fn record_error(&self) {
        let mut inner = self.inner.write().await;
        inner.total_requests += 1;
        inner.transport_errors += 1;
    }

    /// Get current metrics snapshot
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().await;

        let mut sorted = inner.durations.clone();
        sorted.sort_unstable();

        let avg = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<u64>() as f64 / sorted.len() as f64 / 1000.0
        };

        MetricsSnapshot {
            total_requests: inner.total_requests,
            transport_errors: inner.transport_errors,
            statuses: inner.statuses.clone(),
            probes_passed: inner.probes_passed,
            probes_banned: inner.probes_banned,
            ban_checks_failed: inner.ban_checks_failed,
            health_allowed: inner.health_allowed,
            health_blocked: inner.health_blocked,
            avg_duration_ms: avg,
            p50_duration_ms: percentile_ms(&sorted, 50.0),
            p95_duration_ms: percentile_ms(&sorted, 95.0),
            p99_duration_ms: percentile_ms(&sorted, 99.0),
        }
    }
}

impl MetricsInner {
    fn record_response(&mut self, status: u16, duration: Duration) {
        self.total_requests += 1;
        *self.statuses.entry(status).or_insert(0) += 1;
        self.durations
            .push(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX));
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest-rank percentile over sorted microsecond samples, in ms
fn percentile_ms(sorted: &[u64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * sorted.len() as f64) as usize;
    let idx = idx.min(sorted.len() - 1);
    sorted[idx] as f64 / 1000.0
}

impl MetricsSnapshot {
    /// Reasons the run should be considered failed
    pub fn failures(&self, p95_threshold_ms: f64) -> Vec<String> {
        let mut failures = Vec::new();
        if self.p95_duration_ms >= p95_threshold_ms {
            failures.push(format!(
                "p95 latency {:.2}ms is not below {:.2}ms",
                self.p95_duration_ms, p95_threshold_ms
            ));
        }
        if self.ban_checks_failed > 0 {
            failures.push(format!(
                "{} rejection(s) without the ban message",
                self.ban_checks_failed
            ));
        }
        if self.total_requests == 0 {
            failures.push("no requests completed".to_string());
        }
        failures
    }

    /// Print statistics in a readable format
    pub fn print(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let rps = if secs > 0.0 {
            self.total_requests as f64 / secs
        } else {
            0.0
        };

        println!("\n=== LOAD TEST RESULTS ===");
        println!("Elapsed: {:.1}s", secs);
        println!("Total Requests: {}", self.total_requests);
        println!("Requests/sec: {:.2}", rps);
        if self.transport_errors > 0 {
            println!("Transport Errors: {}", self.transport_errors);
        }
        println!();

        println!("Status Codes:");
        for (status, count) in &self.statuses {
            println!("  {}: {}", status, count);
        }
        println!();

        println!("Probes:");
        println!("  Passed: {}", self.probes_passed);
        println!("  Banned (429): {}", self.probes_banned);
        println!("Health Checks:");
        println!("  Allowed: {}", self.health_allowed);
        println!("  Blocked: {}", self.health_blocked);
        println!("Ban Message Checks Failed: {}", self.ban_checks_failed);
        println!();

        println!("Latency:");
        println!("  Average: {:.2}ms", self.avg_duration_ms);
        println!("  P50: {:.2}ms", self.p50_duration_ms);
        println!("  P95: {:.2}ms", self.p95_duration_ms);
        println!("  P99: {:.2}ms", self.p99_duration_ms);
    }
}
