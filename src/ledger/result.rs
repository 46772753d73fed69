use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::DeductionPath;

/// Why a ledger operation did not move tokens. Store errors are folded into
/// `Unavailable`; they never reach the caller as raw errors.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerFailure {
    #[error("Insufficient balance: {required} tokens required, {available} available")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("No token profile for user {user_id}")]
    ProfileNotFound { user_id: String },

    #[error("Token amount must be greater than zero")]
    InvalidAmount,

    #[error("Ledger unavailable: {message}")]
    Unavailable { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeductionResult {
    pub success: bool,
    /// Post-deduction balance on success; the untouched balance when the
    /// balance was insufficient; zero when it could not be read.
    pub balance: u64,
    pub tokens: u64,
    pub transaction_id: Option<Uuid>,
    pub path: Option<DeductionPath>,
    /// Tokens a clamped fallback debit could not cover.
    pub shortfall: u64,
    pub error: Option<LedgerFailure>,
}

impl DeductionResult {
    pub(crate) fn failed(tokens: u64, balance: u64, error: LedgerFailure) -> Self {
        Self {
            success: false,
            balance,
            tokens,
            transaction_id: None,
            path: None,
            shortfall: 0,
            error: Some(error),
        }
    }

    pub fn is_insufficient(&self) -> bool {
        matches!(self.error, Some(LedgerFailure::InsufficientBalance { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditResult {
    pub success: bool,
    pub balance: u64,
    pub transaction_id: Option<Uuid>,
    pub error: Option<LedgerFailure>,
}
