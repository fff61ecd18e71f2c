use anyhow::{Result, anyhow};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sampling resolution of a data subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    Tick,
    Second,
    Minute,
    Hour,
    Daily,
}

impl Resolution {
    /// Length of one bar period. Ticks have no fixed period.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Resolution::Tick => None,
            Resolution::Second => Some(Duration::seconds(1)),
            Resolution::Minute => Some(Duration::minutes(1)),
            Resolution::Hour => Some(Duration::hours(1)),
            Resolution::Daily => Some(Duration::days(1)),
        }
    }

    /// Returns true for resolutions whose periods are positioned on an intraday grid
    pub fn is_intraday(&self) -> bool {
        matches!(
            self,
            Resolution::Second | Resolution::Minute | Resolution::Hour
        )
    }

    /// Returns all resolutions from finest to coarsest
    pub fn all() -> Vec<Resolution> {
        vec![
            Resolution::Tick,
            Resolution::Second,
            Resolution::Minute,
            Resolution::Hour,
            Resolution::Daily,
        ]
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Resolution::Tick => "tick",
            Resolution::Second => "second",
            Resolution::Minute => "minute",
            Resolution::Hour => "hour",
            Resolution::Daily => "daily",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Resolution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tick" => Ok(Resolution::Tick),
            "second" | "1s" => Ok(Resolution::Second),
            "minute" | "1m" | "1min" => Ok(Resolution::Minute),
            "hour" | "1h" => Ok(Resolution::Hour),
            "daily" | "day" | "1d" => Ok(Resolution::Daily),
            _ => Err(anyhow!(
                "Invalid resolution: {}. Must be one of: tick, second, minute, hour, daily",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_periods() {
        assert_eq!(Resolution::Tick.period(), None);
        assert_eq!(Resolution::Minute.period(), Some(Duration::minutes(1)));
        assert_eq!(Resolution::Daily.period(), Some(Duration::days(1)));
    }

    #[test]
    fn test_from_str_aliases() {
        assert_eq!(Resolution::from_str("1m").unwrap(), Resolution::Minute);
        assert_eq!(Resolution::from_str("Daily").unwrap(), Resolution::Daily);
        assert!(Resolution::from_str("weekly").is_err());
    }

    #[test]
    fn test_display_round_trips_through_from_str() {
        for resolution in Resolution::all() {
            let parsed = Resolution::from_str(&resolution.to_string()).unwrap();
            assert_eq!(parsed, resolution);
        }
    }

    #[test]
    fn test_ordering_is_fine_to_coarse() {
        assert!(Resolution::Tick < Resolution::Minute);
        assert!(Resolution::Hour < Resolution::Daily);
        assert!(!Resolution::Daily.is_intraday());
        assert!(Resolution::Second.is_intraday());
    }
}
