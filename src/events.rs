//! Balance-change notifications.
//!
//! Any number of UI surfaces or services can subscribe and refresh when a
//! user's balance moves, instead of polling the store or sharing state.
//! Publishing never blocks and never fails the operation that triggered it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceChange {
    Deducted,
    Credited,
    Refreshed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEvent {
    pub user_id: String,
    pub change: BalanceChange,
    pub tokens: u64,
    pub balance: u64,
    pub at: DateTime<Utc>,
}

impl BalanceEvent {
    pub fn new(
        user_id: impl Into<String>,
        change: BalanceChange,
        tokens: u64,
        balance: u64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            change,
            tokens,
            balance,
            at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BalanceNotifier {
    sender: broadcast::Sender<BalanceEvent>,
}

impl BalanceNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BalanceEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: BalanceEvent) -> usize {
        tracing::debug!(
            user_id = %event.user_id,
            change = ?event.change,
            balance = event.balance,
            "balance changed"
        );
        // No subscribers is not an error.
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for BalanceNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
