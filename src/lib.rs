//! # kroniq-metering
//!
//! Metering and entitlements for a multi-provider generation service: who
//! may generate what, how many metered tokens it costs, and an auditable
//! record of every token moved.
//!
//! - [`tier::TierResolver`] decides free or paid tier from a user's plan and
//!   balance.
//! - [`quota::QuotaGate`] enforces free-tier daily and monthly caps per
//!   generation type.
//! - [`ledger::TokenLedger`] deducts tokens atomically, with a degraded
//!   non-atomic fallback, and records transactions.
//! - [`estimator::CostEstimator`] quotes a request before anything is spent.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kroniq_metering::prelude::*;
//!
//! struct Slides;
//!
//! #[async_trait::async_trait]
//! impl Generator for Slides {
//!     fn name(&self) -> &str {
//!         "gamma"
//!     }
//!
//!     async fn generate(
//!         &self,
//!         request: &GenerationRequest,
//!     ) -> std::result::Result<GenerationOutput, GeneratorError> {
//!         Ok(GenerationOutput::new(format!("deck: {}", request.prompt)))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let profiles = MemoryProfileStore::with_profiles([
//!         UserProfile::new("user-1").with_paid_tokens(1_000_000),
//!     ]);
//!     let metering = Metering::builder(Arc::new(profiles), Arc::new(MemoryUsageStore::new()))
//!         .build();
//!
//!     let request = GenerationRequest::media(GenerationType::Ppt, "gamma-ppt", "Q3 review");
//!     let outcome = metering.run("user-1", &request, &Slides).await?;
//!     println!("balance now {}", outcome.deduction.balance);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod clock;
pub mod config;
pub mod estimator;
pub mod events;
pub mod ledger;
pub mod metering;
pub mod observability;
pub mod prelude;
pub mod pricing;
pub mod quota;
pub mod store;
pub mod tier;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigBuilder, ConfigError, ConfigProvider, MeteringSettings};
pub use estimator::{CostEstimate, CostEstimator};
pub use events::{BalanceChange, BalanceEvent, BalanceNotifier};
pub use ledger::{CreditResult, DeductionResult, LedgerFailure, TokenLedger};
pub use metering::{
    GenerationOutput, GenerationRequest, Generator, GeneratorError, MeteredOutcome, Metering,
    MeteringBuilder,
};
pub use observability::{MeteringMetrics, MetricsSummary};
pub use pricing::{ModelCost, PricingTable, PricingTableBuilder, TokenizerKind};
pub use quota::{GenerationLimits, LimitCheck, QuotaGate, UsageDecision};
pub use store::{
    CounterUpdate, DeductOutcome, MemoryProfileStore, MemoryUsageStore, ProfileStore, StoreError,
    StoreResult, UsageStore,
};
pub use tier::{Tier, TierResolver, UserTier};
pub use types::{
    DeductionPath, GenerationType, Plan, TokenTransaction, TransactionKind, UsagePeriod,
    UserProfile,
};

/// Error type for facade and configuration operations.
///
/// The components themselves return structured results; this type appears
/// only where a caller has to stop.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Free-tier cap reached; `message` is suitable for display.
    #[error("Quota exceeded for {kind}: {current}/{limit}")]
    QuotaExceeded {
        kind: GenerationType,
        current: u32,
        limit: u32,
        message: String,
    },

    #[error("Insufficient balance: {required} tokens required, {available} available")]
    InsufficientBalance { required: u64, available: u64 },

    #[error(transparent)]
    Generation(#[from] GeneratorError),
}

impl Error {
    /// Expected outcomes of entitlement checks rather than system faults.
    pub fn is_entitlement(&self) -> bool {
        matches!(
            self,
            Error::QuotaExceeded { .. } | Error::InsufficientBalance { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(StoreError::Unavailable { .. }) | Error::Generation(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
