//! Pool instrumentation.
//!
//! With the `metrics` feature, pools record through OpenTelemetry instruments
//! installed by [`init`]. Until `init` runs (or without the feature) every
//! recording function is a no-op, so the pool never depends on a meter
//! provider being configured.
//!
//! | Instrument               | Kind    | Attributes |
//! |--------------------------|---------|------------|
//! | `muxpool.acquires`       | counter | `endpoint` |
//! | `muxpool.dials`          | counter | `endpoint` |
//! | `muxpool.dial_failures`  | counter | `endpoint` |
//! | `muxpool.replacements`   | counter | `endpoint` |

#[cfg(feature = "metrics")]
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(feature = "metrics")]
static ACQUIRES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static DIALS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static DIAL_FAILURES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REPLACEMENTS: OnceLock<Counter<u64>> = OnceLock::new();

/// Installs the pool instruments on `meter`. Later calls are ignored.
#[cfg(feature = "metrics")]
pub fn init(meter: &Meter) {
    let _ = ACQUIRES.set(
        meter
            .u64_counter("muxpool.acquires")
            .with_description("Connections handed out by the pool")
            .build(),
    );

    let _ = DIALS.set(
        meter
            .u64_counter("muxpool.dials")
            .with_description("Dial attempts for empty or unhealthy slots")
            .build(),
    );

    let _ = DIAL_FAILURES.set(
        meter
            .u64_counter("muxpool.dial_failures")
            .with_description("Dial attempts that failed")
            .build(),
    );

    let _ = REPLACEMENTS.set(
        meter
            .u64_counter("muxpool.replacements")
            .with_description("Unhealthy connections replaced by a fresh dial")
            .build(),
    );
}

#[cfg(feature = "metrics")]
fn add(counter: &OnceLock<Counter<u64>>, endpoint: &str) {
    if let Some(counter) = counter.get() {
        counter.add(1, &[KeyValue::new("endpoint", endpoint.to_owned())]);
    }
}

#[cfg(feature = "metrics")]
pub(crate) fn record_acquire(endpoint: &str) {
    add(&ACQUIRES, endpoint);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_acquire(_endpoint: &str) {}

#[cfg(feature = "metrics")]
pub(crate) fn record_dial(endpoint: &str) {
    add(&DIALS, endpoint);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_dial(_endpoint: &str) {}

#[cfg(feature = "metrics")]
pub(crate) fn record_dial_failure(endpoint: &str) {
    add(&DIAL_FAILURES, endpoint);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_dial_failure(_endpoint: &str) {}

#[cfg(feature = "metrics")]
pub(crate) fn record_replacement(endpoint: &str) {
    add(&REPLACEMENTS, endpoint);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_replacement(_endpoint: &str) {}
