//! Static model pricing shared by the cost estimator and the token ledger.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

mod table;
mod tokenizer;

pub use table::{
    DEFAULT_TOKENS_PER_USD, ModelCost, PricingTable, PricingTableBuilder, derive_tokens,
    global_pricing_table,
};
pub use tokenizer::{TokenizerKind, estimate_tokens};

/// Margin added on top of provider cost when quoting a request.
pub const DEFAULT_PROFIT_MARGIN: Decimal = dec!(0.35);

/// Scale factor for storing Decimal costs as AtomicU64 (6 decimal places precision).
pub(crate) const COST_SCALE_FACTOR: Decimal = dec!(1_000_000);
