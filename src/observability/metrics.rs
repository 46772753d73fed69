//! Metering metrics.
//!
//! Plain atomics, readable in-process and cheap enough to update on every
//! request. Export is left to the embedding service.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use rust_decimal::Decimal;

use crate::pricing::COST_SCALE_FACTOR;
use crate::types::DeductionPath;

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Generation calls range from sub-second text replies to multi-minute
    /// video renders.
    pub fn generation_latency() -> Self {
        Self::new(vec![
            100.0, 500.0, 1_000.0, 5_000.0, 15_000.0, 30_000.0, 60_000.0, 180_000.0, 600_000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    /// Sum in the observed unit; stored internally scaled by 1000.
    pub fn sum_ms(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

/// Counters for every metering decision.
#[derive(Debug)]
pub struct MeteringMetrics {
    pub deductions_atomic: Counter,
    pub deductions_fallback: Counter,
    pub deductions_failed: Counter,
    pub insufficient_balance: Counter,
    pub tokens_deducted: Counter,
    pub tokens_credited: Counter,
    pub shortfall_tokens: Counter,
    pub cost_total_micros: Counter,
    pub quota_checks: Counter,
    pub quota_blocked: Counter,
    pub quota_fail_open: Counter,
    pub tier_defaults: Counter,
    pub daily_refreshes: Counter,
    pub generations_in_flight: Gauge,
    pub generation_latency_ms: Histogram,
}

impl MeteringMetrics {
    pub fn new() -> Self {
        Self {
            deductions_atomic: Counter::new(),
            deductions_fallback: Counter::new(),
            deductions_failed: Counter::new(),
            insufficient_balance: Counter::new(),
            tokens_deducted: Counter::new(),
            tokens_credited: Counter::new(),
            shortfall_tokens: Counter::new(),
            cost_total_micros: Counter::new(),
            quota_checks: Counter::new(),
            quota_blocked: Counter::new(),
            quota_fail_open: Counter::new(),
            tier_defaults: Counter::new(),
            daily_refreshes: Counter::new(),
            generations_in_flight: Gauge::new(),
            generation_latency_ms: Histogram::generation_latency(),
        }
    }

    pub fn record_deduction(&self, path: DeductionPath, tokens: u64, shortfall: u64) {
        match path {
            DeductionPath::Atomic => self.deductions_atomic.inc(),
            DeductionPath::Fallback => self.deductions_fallback.inc(),
        }
        self.tokens_deducted.add(tokens.saturating_sub(shortfall));
        self.shortfall_tokens.add(shortfall);
    }

    pub fn record_cost(&self, cost_usd: Decimal) {
        let micros = u64::try_from((cost_usd * COST_SCALE_FACTOR).trunc()).unwrap_or(0);
        self.cost_total_micros.add(micros);
    }

    pub fn record_quota(&self, allowed: bool) {
        self.quota_checks.inc();
        if !allowed {
            self.quota_blocked.inc();
        }
    }

    pub fn record_generation_start(&self) {
        self.generations_in_flight.inc();
    }

    pub fn record_generation_end(&self, latency_ms: f64) {
        self.generations_in_flight.dec();
        self.generation_latency_ms.observe(latency_ms);
    }

    pub fn total_cost_usd(&self) -> Decimal {
        Decimal::from(self.cost_total_micros.get()) / COST_SCALE_FACTOR
    }
}

impl Default for MeteringMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of [`MeteringMetrics`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    pub successful_deductions: u64,
    pub fallback_deductions: u64,
    pub failed_deductions: u64,
    pub insufficient_balance: u64,
    pub tokens_deducted: u64,
    pub tokens_credited: u64,
    pub shortfall_tokens: u64,
    pub total_cost_usd: Decimal,
    pub quota_checks: u64,
    pub quota_blocked: u64,
    pub quota_fail_open: u64,
    pub avg_generation_ms: f64,
}

impl MetricsSummary {
    pub fn from_metrics(metrics: &MeteringMetrics) -> Self {
        let count = metrics.generation_latency_ms.count();
        let avg = if count > 0 {
            metrics.generation_latency_ms.sum_ms() / count as f64
        } else {
            0.0
        };

        Self {
            successful_deductions: metrics.deductions_atomic.get()
                + metrics.deductions_fallback.get(),
            fallback_deductions: metrics.deductions_fallback.get(),
            failed_deductions: metrics.deductions_failed.get(),
            insufficient_balance: metrics.insufficient_balance.get(),
            tokens_deducted: metrics.tokens_deducted.get(),
            tokens_credited: metrics.tokens_credited.get(),
            shortfall_tokens: metrics.shortfall_tokens.get(),
            total_cost_usd: metrics.total_cost_usd(),
            quota_checks: metrics.quota_checks.get(),
            quota_blocked: metrics.quota_blocked.get(),
            quota_fail_open: metrics.quota_fail_open.get(),
            avg_generation_ms: avg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);

        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), -1);
    }

    #[test]
    fn test_histogram_buckets() {
        let hist = Histogram::new(vec![10.0, 100.0]);
        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(500.0);
        assert_eq!(hist.count(), 3);
        assert_eq!(hist.bucket_counts(), vec![1, 1, 1]);
        assert!((hist.sum_ms() - 555.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_summary() {
        let metrics = MeteringMetrics::new();
        metrics.record_deduction(DeductionPath::Atomic, 250_000, 0);
        metrics.record_deduction(DeductionPath::Fallback, 100, 40);
        metrics.record_cost(dec!(0.25));
        metrics.record_quota(false);
        metrics.record_generation_start();
        metrics.record_generation_end(1_200.0);

        let summary = MetricsSummary::from_metrics(&metrics);
        assert_eq!(summary.successful_deductions, 2);
        assert_eq!(summary.fallback_deductions, 1);
        assert_eq!(summary.tokens_deducted, 250_060);
        assert_eq!(summary.shortfall_tokens, 40);
        assert_eq!(summary.total_cost_usd, dec!(0.25));
        assert_eq!(summary.quota_blocked, 1);
        assert_eq!(metrics.generations_in_flight.get(), 0);
    }
}
