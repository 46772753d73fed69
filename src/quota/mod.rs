//! Free-tier generation caps.
//!
//! Two ways to enforce a cap:
//!
//! - [`QuotaGate::check_generation_limit`] before generating, then
//!   [`QuotaGate::increment_generation_count`] after a successful generation.
//!   Two concurrent requests can both pass the check before either
//!   increments, so a user may exceed the daily cap by the number of
//!   requests in flight.
//! - [`QuotaGate::check_and_increment_usage`] against the monthly counter,
//!   which checks and increments in one store operation and has no such
//!   window.

mod gate;
mod limits;

pub use gate::{LimitCheck, QuotaGate, UsageDecision};
pub use limits::{GenerationLimits, PAID_TIER_SENTINEL};
