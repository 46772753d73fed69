use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::UnknownVariant;

/// Free tokens are replenished at most once per this many hours.
pub const DAILY_REFRESH_INTERVAL_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Enterprise,
    Premium,
    Paid,
}

impl Plan {
    pub const ALL: [Plan; 5] = [
        Plan::Free,
        Plan::Pro,
        Plan::Enterprise,
        Plan::Premium,
        Plan::Paid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
            Self::Premium => "premium",
            Self::Paid => "paid",
        }
    }

    /// Lenient parse for labels read back from a store. Unknown labels map to
    /// `Free` so a malformed record never grants paid entitlements.
    pub fn from_label(label: &str) -> Self {
        label.parse().unwrap_or_else(|_| {
            tracing::warn!(label, "unknown plan label, treating as free");
            Self::Free
        })
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|plan| plan.as_str() == normalized)
            .ok_or_else(|| UnknownVariant::new("plan", s))
    }
}

/// A user's metering record as held by the profile store.
///
/// `token_balance` always equals `free_tokens + paid_tokens`. All mutators
/// keep that relation and saturate at zero instead of underflowing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub plan: Plan,
    pub token_balance: u64,
    pub free_tokens: u64,
    pub paid_tokens: u64,
    pub daily_free_token_allowance: u64,
    pub last_token_refresh: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            plan: Plan::Free,
            token_balance: 0,
            free_tokens: 0,
            paid_tokens: 0,
            daily_free_token_allowance: 0,
            last_token_refresh: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_free_tokens(mut self, tokens: u64) -> Self {
        self.free_tokens = tokens;
        self.recompute_balance();
        self
    }

    pub fn with_paid_tokens(mut self, tokens: u64) -> Self {
        self.paid_tokens = tokens;
        self.recompute_balance();
        self
    }

    pub fn with_daily_allowance(mut self, tokens: u64) -> Self {
        self.daily_free_token_allowance = tokens;
        self
    }

    pub fn with_last_refresh(mut self, at: DateTime<Utc>) -> Self {
        self.last_token_refresh = Some(at);
        self
    }

    /// Spends free tokens first, then paid tokens. Returns the shortfall: the
    /// part of `tokens` the balance could not cover. The balance clamps at zero.
    pub fn debit(&mut self, tokens: u64, now: DateTime<Utc>) -> u64 {
        let from_free = tokens.min(self.free_tokens);
        self.free_tokens -= from_free;

        let rest = tokens - from_free;
        let from_paid = rest.min(self.paid_tokens);
        self.paid_tokens -= from_paid;

        self.recompute_balance();
        self.updated_at = now;
        rest - from_paid
    }

    pub fn credit(&mut self, tokens: u64, now: DateTime<Utc>) {
        self.paid_tokens = self.paid_tokens.saturating_add(tokens);
        self.recompute_balance();
        self.updated_at = now;
    }

    pub fn is_enrolled_in_daily_refresh(&self) -> bool {
        self.daily_free_token_allowance > 0
    }

    pub fn refresh_due(&self, now: DateTime<Utc>) -> bool {
        self.is_enrolled_in_daily_refresh()
            && self
                .last_token_refresh
                .is_none_or(|last| now - last >= Duration::hours(DAILY_REFRESH_INTERVAL_HOURS))
    }

    /// Resets the free bucket to the daily allowance. Unspent free tokens do
    /// not roll over.
    pub fn refresh_free_tokens(&mut self, now: DateTime<Utc>) {
        self.free_tokens = self.daily_free_token_allowance;
        self.last_token_refresh = Some(now);
        self.updated_at = now;
        self.recompute_balance();
    }

    fn recompute_balance(&mut self) {
        self.token_balance = self.free_tokens.saturating_add(self.paid_tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_plan_parse() {
        assert_eq!("Premium".parse::<Plan>().unwrap(), Plan::Premium);
        assert_eq!(" paid ".parse::<Plan>().unwrap(), Plan::Paid);
        assert!("gold".parse::<Plan>().is_err());
        assert_eq!(Plan::from_label("gold"), Plan::Free);
    }

    #[test]
    fn test_debit_spends_free_first() {
        let mut profile = UserProfile::new("u1")
            .with_free_tokens(100)
            .with_paid_tokens(1_000);

        assert_eq!(profile.debit(150, Utc::now()), 0);
        assert_eq!(profile.free_tokens, 0);
        assert_eq!(profile.paid_tokens, 950);
        assert_eq!(profile.token_balance, 950);
    }

    #[test]
    fn test_debit_clamps_at_zero() {
        let at = Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).unwrap();
        let mut profile = UserProfile::new("u1").with_paid_tokens(40);

        assert_eq!(profile.debit(100, at), 60);
        assert_eq!(profile.token_balance, 0);
        assert_eq!(profile.updated_at, at);
    }

    #[test]
    fn test_refresh_due() {
        let now = Utc::now();
        let profile = UserProfile::new("u1").with_daily_allowance(5_000);
        assert!(profile.refresh_due(now));

        let recent = profile.clone().with_last_refresh(now - Duration::hours(3));
        assert!(!recent.refresh_due(now));

        let stale = profile.with_last_refresh(now - Duration::hours(25));
        assert!(stale.refresh_due(now));

        let not_enrolled = UserProfile::new("u2");
        assert!(!not_enrolled.refresh_due(now));
    }

    #[test]
    fn test_refresh_does_not_roll_over() {
        let now = Utc::now();
        let mut profile = UserProfile::new("u1")
            .with_daily_allowance(1_000)
            .with_free_tokens(700)
            .with_paid_tokens(50);

        profile.refresh_free_tokens(now);
        assert_eq!(profile.free_tokens, 1_000);
        assert_eq!(profile.token_balance, 1_050);
        assert_eq!(profile.last_token_refresh, Some(now));
    }
}
