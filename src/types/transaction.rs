use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Debit,
    Credit,
    Refresh,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
            Self::Refresh => "refresh",
        }
    }
}

/// Which ledger path settled a debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeductionPath {
    /// Single store operation that checks and debits under one lock.
    Atomic,
    /// Read-then-write degraded mode. Not safe under concurrent writers.
    Fallback,
}

impl DeductionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Atomic => "atomic",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for DeductionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only ledger entry. Never mutated once a store has accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenTransaction {
    pub id: Uuid,
    pub user_id: String,
    pub kind: TransactionKind,
    pub tokens: u64,
    /// Provider-side cost in USD, kept apart from token bookkeeping.
    pub cost_usd: Decimal,
    pub model_id: Option<String>,
    pub provider: Option<String>,
    pub request_type: Option<String>,
    pub path: Option<DeductionPath>,
    /// Tokens a clamped fallback debit could not cover.
    pub shortfall: u64,
    pub balance_after: u64,
    pub created_at: DateTime<Utc>,
}

impl TokenTransaction {
    fn new(user_id: impl Into<String>, kind: TransactionKind, tokens: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            kind,
            tokens,
            cost_usd: Decimal::ZERO,
            model_id: None,
            provider: None,
            request_type: None,
            path: None,
            shortfall: 0,
            balance_after: 0,
            created_at: Utc::now(),
        }
    }

    pub fn debit(
        user_id: impl Into<String>,
        tokens: u64,
        cost_usd: Decimal,
        model_id: impl Into<String>,
        provider: impl Into<String>,
        request_type: impl Into<String>,
    ) -> Self {
        Self {
            cost_usd,
            model_id: Some(model_id.into()),
            provider: Some(provider.into()),
            request_type: Some(request_type.into()),
            ..Self::new(user_id, TransactionKind::Debit, tokens)
        }
    }

    pub fn credit(user_id: impl Into<String>, tokens: u64, reason: impl Into<String>) -> Self {
        Self {
            request_type: Some(reason.into()),
            ..Self::new(user_id, TransactionKind::Credit, tokens)
        }
    }

    pub fn refresh(user_id: impl Into<String>, tokens: u64) -> Self {
        Self {
            request_type: Some("daily_refresh".into()),
            ..Self::new(user_id, TransactionKind::Refresh, tokens)
        }
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_path(mut self, path: DeductionPath) -> Self {
        self.path = Some(path);
        self
    }

    /// Tokens actually taken from the balance.
    pub fn settled_tokens(&self) -> u64 {
        self.tokens.saturating_sub(self.shortfall)
    }
}
