//! Domain records shared by the resolver, gate and ledger.

mod generation;
mod profile;
mod transaction;

pub use generation::{GenerationType, UsagePeriod};
pub use profile::{Plan, UserProfile, DAILY_REFRESH_INTERVAL_HOURS};
pub use transaction::{DeductionPath, TokenTransaction, TransactionKind};

use thiserror::Error;

/// A stored or configured label did not match any known variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}
