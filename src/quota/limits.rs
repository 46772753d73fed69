use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::GenerationType;

/// Cap compared against paid users so both tiers share one code path.
pub const PAID_TIER_SENTINEL: u32 = 999_999;

/// Free-tier caps per generation type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationLimits {
    pub daily: BTreeMap<GenerationType, u32>,
    pub monthly: BTreeMap<GenerationType, u32>,
    pub paid_sentinel: u32,
}

impl GenerationLimits {
    /// Types without a daily entry are uncapped (sentinel).
    pub fn daily_limit(&self, kind: GenerationType) -> u32 {
        self.daily.get(&kind).copied().unwrap_or(self.paid_sentinel)
    }

    pub fn monthly_limit(&self, kind: GenerationType) -> u32 {
        self.monthly.get(&kind).copied().unwrap_or(self.paid_sentinel)
    }
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            daily: BTreeMap::from([
                (GenerationType::Image, 7),
                (GenerationType::Video, 2),
                (GenerationType::Song, 2),
                (GenerationType::Tts, 10),
                (GenerationType::Ppt, 1),
            ]),
            monthly: BTreeMap::from([
                (GenerationType::Ppt, 5),
                (GenerationType::Image, 50),
                (GenerationType::Video, 10),
            ]),
            paid_sentinel: PAID_TIER_SENTINEL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = GenerationLimits::default();
        assert_eq!(limits.daily_limit(GenerationType::Image), 7);
        assert_eq!(limits.daily_limit(GenerationType::Tts), 10);
        assert_eq!(limits.monthly_limit(GenerationType::Ppt), 5);
        assert_eq!(limits.monthly_limit(GenerationType::Song), PAID_TIER_SENTINEL);
    }
}
