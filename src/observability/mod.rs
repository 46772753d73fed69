//! Structured tracing and in-process metrics for metering.
//!
//! Every ledger and quota decision is logged through `tracing` with the user,
//! model and outcome as fields, and counted in [`MeteringMetrics`]. Enable the
//! `subscriber` feature for a ready-made console subscriber:
//!
//! ```rust,ignore
//! kroniq_metering::observability::init_tracing()?;
//! ```

mod metrics;
mod spans;
#[cfg(feature = "subscriber")]
mod subscriber;

pub use metrics::{Counter, Gauge, Histogram, MeteringMetrics, MetricsSummary};
pub use spans::{GenerationSpan, deduction_span, quota_span};
#[cfg(feature = "subscriber")]
pub use subscriber::{SubscriberError, init_tracing};
