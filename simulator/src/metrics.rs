//! Simulation metrics.

use std::collections::BTreeMap;
use std::time::Duration;

use ledgerline_common::LedgerError;
use serde::Serialize;

/// Simulation metrics.
#[derive(Debug, Clone, Default)]
pub struct SimulationMetrics {
    /// Operations attempted.
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Failures keyed by error code.
    pub errors: BTreeMap<&'static str, u64>,
    /// Quote reuse attempts correctly rejected.
    pub reuse_rejected: u64,
    /// Latency samples of every attempt, in microseconds.
    latency_us: Vec<u64>,
}

impl SimulationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: &Result<(), LedgerError>, latency: Duration) {
        self.total += 1;
        match result {
            Ok(()) => self.succeeded += 1,
            Err(err) => {
                self.failed += 1;
                *self.errors.entry(err.error_code()).or_default() += 1;
            }
        }
        self.latency_us
            .push(u64::try_from(latency.as_micros()).unwrap_or(u64::MAX));
    }

    /// Latency at `percentile` (0-100), in microseconds.
    pub fn percentile_us(&self, percentile: usize) -> u64 {
        if self.latency_us.is_empty() {
            return 0;
        }
        let mut sorted = self.latency_us.clone();
        sorted.sort_unstable();
        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
            errors: self
                .errors
                .iter()
                .map(|(code, count)| (code.to_string(), *count))
                .collect(),
            reuse_rejected: self.reuse_rejected,
            success_rate: self.success_rate(),
            p50_us: self.percentile_us(50),
            p95_us: self.percentile_us(95),
            p99_us: self.percentile_us(99),
        }
    }
}

/// Serializable end-of-run summary.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub errors: BTreeMap<String, u64>,
    pub reuse_rejected: u64,
    pub success_rate: f64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}
