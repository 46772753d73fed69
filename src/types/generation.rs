use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::UnknownVariant;

/// Kinds of metered generation that carry a free-tier cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationType {
    Image,
    Video,
    Song,
    Tts,
    Ppt,
}

impl GenerationType {
    pub const ALL: [GenerationType; 5] = [
        GenerationType::Image,
        GenerationType::Video,
        GenerationType::Song,
        GenerationType::Tts,
        GenerationType::Ppt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Song => "song",
            Self::Tts => "tts",
            Self::Ppt => "ppt",
        }
    }

    /// Plural noun used in user-facing quota messages.
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Video => "videos",
            Self::Song => "songs",
            Self::Tts => "voice generations",
            Self::Ppt => "presentations",
        }
    }
}

impl fmt::Display for GenerationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "image" | "images" => Ok(Self::Image),
            "video" | "videos" => Ok(Self::Video),
            "song" | "songs" | "music" => Ok(Self::Song),
            "tts" | "voice" => Ok(Self::Tts),
            "ppt" | "presentation" => Ok(Self::Ppt),
            _ => Err(UnknownVariant::new("generation type", s)),
        }
    }
}

/// Counter window for usage records. Days and months are UTC calendar units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsagePeriod {
    Day(NaiveDate),
    Month { year: i32, month: u32 },
}

impl UsagePeriod {
    pub fn day_of(now: DateTime<Utc>) -> Self {
        Self::Day(now.date_naive())
    }

    pub fn month_of(now: DateTime<Utc>) -> Self {
        Self::Month {
            year: now.year(),
            month: now.month(),
        }
    }

    /// Storage key: `2026-03-01` for days, `2026-03` for months.
    pub fn key(&self) -> String {
        match self {
            Self::Day(date) => date.format("%Y-%m-%d").to_string(),
            Self::Month { year, month } => format!("{:04}-{:02}", year, month),
        }
    }

    pub fn is_daily(&self) -> bool {
        matches!(self, Self::Day(_))
    }
}

impl fmt::Display for UsagePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_generation_type_aliases() {
        assert_eq!("music".parse::<GenerationType>().unwrap(), GenerationType::Song);
        assert_eq!("Voice".parse::<GenerationType>().unwrap(), GenerationType::Tts);
        assert_eq!(
            "presentation".parse::<GenerationType>().unwrap(),
            GenerationType::Ppt
        );
        assert!("hologram".parse::<GenerationType>().is_err());
    }

    #[test]
    fn test_period_keys() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 0).unwrap();
        assert_eq!(UsagePeriod::day_of(now).key(), "2026-03-01");
        assert_eq!(UsagePeriod::month_of(now).key(), "2026-03");
    }

    #[test]
    fn test_day_rolls_over_at_utc_midnight() {
        let before = Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 59).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        assert_ne!(UsagePeriod::day_of(before), UsagePeriod::day_of(after));
        assert_eq!(UsagePeriod::month_of(before), UsagePeriod::month_of(after));
    }
}
