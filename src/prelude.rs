//! Common imports for services embedding the metering layer.
//!
//! ```rust
//! use kroniq_metering::prelude::*;
//! ```

pub use crate::Error;
pub use crate::Result;

pub use crate::metering::{
    GenerationOutput, GenerationRequest, Generator, GeneratorError, MeteredOutcome, Metering,
};

pub use crate::events::{BalanceChange, BalanceEvent, BalanceNotifier};
pub use crate::ledger::{DeductionResult, LedgerFailure};
pub use crate::quota::{LimitCheck, UsageDecision};
pub use crate::tier::{Tier, UserTier};

pub use crate::store::{MemoryProfileStore, MemoryUsageStore, ProfileStore, UsageStore};
pub use crate::types::{GenerationType, Plan, UserProfile};
