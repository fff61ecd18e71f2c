use crate::domain::market::calendar::ExchangeCalendar;
use crate::domain::market::data_point::SubscriptionId;
use crate::domain::market::resolution::Resolution;
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    TradeBar,
    Tick,
    Quote,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What a strategy asks for when it subscribes to data.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionDescriptor {
    pub symbol: String,
    pub resolution: Resolution,
    pub kind: DataKind,
    /// Offset of the raw data timestamps; defaults to the exchange offset
    pub data_time_zone: Option<FixedOffset>,
    pub calendar: String,
    pub fill_forward: bool,
    pub extended_hours: bool,
}

impl SubscriptionDescriptor {
    pub fn new(symbol: impl Into<String>, resolution: Resolution) -> Self {
        let kind = if resolution == Resolution::Tick {
            DataKind::Tick
        } else {
            DataKind::TradeBar
        };
        Self {
            symbol: symbol.into(),
            resolution,
            kind,
            data_time_zone: None,
            calendar: "us_equity".to_string(),
            fill_forward: true,
            extended_hours: false,
        }
    }

    pub fn with_kind(mut self, kind: DataKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_calendar(mut self, calendar: impl Into<String>) -> Self {
        self.calendar = calendar.into();
        self
    }

    pub fn with_time_zone(mut self, offset: FixedOffset) -> Self {
        self.data_time_zone = Some(offset);
        self
    }

    pub fn with_fill_forward(mut self, enabled: bool) -> Self {
        self.fill_forward = enabled;
        self
    }

    pub fn with_extended_hours(mut self, enabled: bool) -> Self {
        self.extended_hours = enabled;
        self
    }
}

/// A registered, validated subscription. Owned by the registry and shared read-only.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub symbol: String,
    pub resolution: Resolution,
    pub kind: DataKind,
    pub data_time_zone: FixedOffset,
    pub calendar: Arc<ExchangeCalendar>,
    pub fill_forward: bool,
    pub extended_hours: bool,
}

impl Subscription {
    /// Converts a data-local timestamp to UTC.
    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        (local - Duration::seconds(i64::from(self.data_time_zone.local_minus_utc()))).and_utc()
    }

    /// Session filter applied to every ingested point.
    pub fn accepts(&self, time: DateTime<Utc>, end_time: DateTime<Utc>) -> bool {
        let calendar = &self.calendar;
        match (self.resolution, self.kind) {
            (Resolution::Daily, _) => calendar.is_trading_day(calendar.local_date(time)),
            (_, DataKind::TradeBar) => {
                calendar.contains_period(time, end_time, self.extended_hours)
            }
            _ => calendar.is_open_at(time, self.extended_hours),
        }
    }

    /// Next period end at which this subscription expects data.
    pub fn next_expected_end(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.calendar
            .next_period_end(after, self.resolution, self.extended_hours)
    }

    pub fn period_start(&self, end: DateTime<Utc>) -> DateTime<Utc> {
        self.calendar
            .period_start(end, self.resolution, self.extended_hours)
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} [{}]",
            self.id, self.symbol, self.resolution, self.kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(resolution: Resolution, extended_hours: bool) -> Subscription {
        let calendar = Arc::new(ExchangeCalendar::us_equity());
        Subscription {
            id: SubscriptionId(0),
            symbol: "SPY".to_string(),
            resolution,
            kind: DataKind::TradeBar,
            data_time_zone: calendar.utc_offset,
            calendar,
            fill_forward: true,
            extended_hours,
        }
    }

    fn local(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn test_descriptor_defaults() {
        let descriptor = SubscriptionDescriptor::new("SPY", Resolution::Minute);
        assert_eq!(descriptor.kind, DataKind::TradeBar);
        assert!(descriptor.fill_forward);
        assert!(!descriptor.extended_hours);

        let ticks = SubscriptionDescriptor::new("SPY", Resolution::Tick);
        assert_eq!(ticks.kind, DataKind::Tick);
    }

    #[test]
    fn test_to_utc_applies_data_offset() {
        let sub = subscription(Resolution::Minute, false);
        assert_eq!(
            sub.to_utc(local("2024-01-02 09:30")).to_rfc3339(),
            "2024-01-02T14:30:00+00:00"
        );
    }

    #[test]
    fn test_session_filter_for_minute_bars() {
        let regular = subscription(Resolution::Minute, false);
        let start = regular.to_utc(local("2024-01-02 15:59"));
        let end = regular.to_utc(local("2024-01-02 16:00"));
        assert!(regular.accepts(start, end));

        let after_close = regular.to_utc(local("2024-01-02 16:00"));
        let after_close_end = regular.to_utc(local("2024-01-02 16:01"));
        assert!(!regular.accepts(after_close, after_close_end));

        let extended = subscription(Resolution::Minute, true);
        assert!(extended.accepts(after_close, after_close_end));
    }

    #[test]
    fn test_daily_bars_require_trading_day() {
        let sub = subscription(Resolution::Daily, false);
        let saturday = sub.to_utc(local("2024-01-06 09:30"));
        assert!(!sub.accepts(saturday, saturday + Duration::hours(7)));
    }
}
