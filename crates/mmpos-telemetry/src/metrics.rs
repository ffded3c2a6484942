//! Prometheus metrics for the position manager.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means a
//! duplicate metric name, which is a startup configuration error. These
//! panics only occur during static initialization.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

use crate::error::{TelemetryError, TelemetryResult};

/// Position operations by outcome.
/// Labels: op (supply/redeem/enter_and_borrow/repay/...), outcome (ok/error)
pub static OPERATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "mmpos_operations_total",
        "Position operations by outcome",
        &["op", "outcome"]
    )
    .unwrap()
});

/// Failed operations by error kind.
pub static OPERATION_FAILURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "mmpos_operation_failures_total",
        "Failed position operations by error kind",
        &["op", "kind"]
    )
    .unwrap()
});

/// Operation wall-clock duration in milliseconds.
pub static OPERATION_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "mmpos_operation_latency_ms",
        "Position operation duration in milliseconds",
        &["op"],
        vec![1.0, 5.0, 25.0, 100.0, 500.0, 2_000.0, 10_000.0, 60_000.0]
    )
    .unwrap()
});

/// Compensating actions run after a partial failure.
/// Labels: action (reset_approval/refund/resupply), outcome (ok/error)
pub static COMPENSATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "mmpos_compensations_total",
        "Compensating actions by outcome",
        &["action", "outcome"]
    )
    .unwrap()
});

/// Locally recorded borrow principal per market, in underlying units.
pub static RECORDED_BORROW: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "mmpos_recorded_borrow",
        "Locally recorded borrow principal (underlying units)",
        &["market"]
    )
    .unwrap()
});

/// Supplied share balance per market, in share units.
pub static SUPPLIED_SHARES: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "mmpos_supplied_shares",
        "Locally recorded share balance (share units)",
        &["market"]
    )
    .unwrap()
});

/// Last observed account liquidity in reference currency.
pub static ACCOUNT_LIQUIDITY: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "mmpos_account_liquidity",
        "Last observed account liquidity (reference currency)"
    )
    .unwrap()
});

/// Last observed account shortfall in reference currency.
pub static ACCOUNT_SHORTFALL: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "mmpos_account_shortfall",
        "Last observed account shortfall (reference currency)"
    )
    .unwrap()
});

/// Metrics helper for recording values.
pub struct Metrics;

impl Metrics {
    /// Record a successful operation.
    pub fn operation_ok(op: &str, latency_ms: f64) {
        OPERATIONS_TOTAL.with_label_values(&[op, "ok"]).inc();
        OPERATION_LATENCY_MS
            .with_label_values(&[op])
            .observe(latency_ms);
    }

    /// Record a failed operation with its error kind.
    pub fn operation_failed(op: &str, kind: &str, latency_ms: f64) {
        OPERATIONS_TOTAL.with_label_values(&[op, "error"]).inc();
        OPERATION_FAILURES_TOTAL
            .with_label_values(&[op, kind])
            .inc();
        OPERATION_LATENCY_MS
            .with_label_values(&[op])
            .observe(latency_ms);
    }

    /// Record a compensating action.
    pub fn compensation(action: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        COMPENSATIONS_TOTAL
            .with_label_values(&[action, outcome])
            .inc();
    }

    pub fn recorded_borrow(market: &str, amount: f64) {
        RECORDED_BORROW.with_label_values(&[market]).set(amount);
    }

    pub fn supplied_shares(market: &str, shares: f64) {
        SUPPLIED_SHARES.with_label_values(&[market]).set(shares);
    }

    /// Record a liquidity snapshot. At most one of the two is nonzero.
    pub fn account_liquidity(liquidity: f64, shortfall: f64) {
        ACCOUNT_LIQUIDITY.set(liquidity);
        ACCOUNT_SHORTFALL.set(shortfall);
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
