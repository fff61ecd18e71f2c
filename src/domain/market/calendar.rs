//! Exchange trading calendars.
//!
//! Calendars work with fixed UTC offsets. Daylight-saving transitions are not
//! modelled: a calendar describes one offset for its whole lifetime.

use crate::domain::market::resolution::Resolution;
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc,
    Weekday,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Upper bound on the number of days scanned when looking for the next session.
const MAX_CALENDAR_SCAN_DAYS: usize = 400;

/// Local open/close times of a trading session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl SessionWindow {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Self {
        Self { open, close }
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeCalendar {
    pub name: String,
    pub utc_offset: FixedOffset,
    pub regular: SessionWindow,
    pub extended: Option<SessionWindow>,
    pub trading_days: Vec<Weekday>,
    pub holidays: BTreeSet<NaiveDate>,
    /// 24x7 venues: every day is a trading day and sessions span local midnight to midnight
    pub always_open: bool,
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

impl ExchangeCalendar {
    /// US equities: 09:30-16:00 regular, 04:00-20:00 extended, UTC-5.
    pub fn us_equity() -> Self {
        Self {
            name: "us_equity".to_string(),
            utc_offset: FixedOffset::west_opt(5 * 3600).unwrap_or(Utc.fix()),
            regular: SessionWindow::new(hm(9, 30), hm(16, 0)),
            extended: Some(SessionWindow::new(hm(4, 0), hm(20, 0))),
            trading_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            holidays: BTreeSet::new(),
            always_open: false,
        }
    }

    /// Around-the-clock venue in UTC.
    pub fn always_open(name: &str) -> Self {
        Self {
            name: name.to_string(),
            utc_offset: Utc.fix(),
            regular: SessionWindow::new(NaiveTime::MIN, NaiveTime::MIN),
            extended: None,
            trading_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            holidays: BTreeSet::new(),
            always_open: true,
        }
    }

    pub fn with_holidays(mut self, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(holidays);
        self
    }

    pub fn with_offset(mut self, utc_offset: FixedOffset) -> Self {
        self.utc_offset = utc_offset;
        self
    }

    pub fn local_date(&self, time: DateTime<Utc>) -> NaiveDate {
        time.with_timezone(&self.utc_offset).date_naive()
    }

    pub fn local_to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        (local - Duration::seconds(i64::from(self.utc_offset.local_minus_utc()))).and_utc()
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        if self.holidays.contains(&date) {
            return false;
        }
        self.always_open || self.trading_days.contains(&date.weekday())
    }

    /// Session bounds in UTC for a local date, or `None` on non-trading days.
    pub fn session_bounds(
        &self,
        date: NaiveDate,
        extended: bool,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if !self.is_trading_day(date) {
            return None;
        }
        if self.always_open {
            let open = self.local_to_utc(date.and_time(NaiveTime::MIN));
            return Some((open, open + Duration::days(1)));
        }
        let window = match (extended, self.extended) {
            (true, Some(window)) => window,
            _ => self.regular,
        };
        Some((
            self.local_to_utc(date.and_time(window.open)),
            self.local_to_utc(date.and_time(window.close)),
        ))
    }

    /// True when `time` falls inside a session (open inclusive, close exclusive).
    pub fn is_open_at(&self, time: DateTime<Utc>, extended: bool) -> bool {
        match self.session_bounds(self.local_date(time), extended) {
            Some((open, close)) => open <= time && time < close,
            None => false,
        }
    }

    /// True when the whole period `[start, end]` lies inside one session.
    pub fn contains_period(&self, start: DateTime<Utc>, end: DateTime<Utc>, extended: bool) -> bool {
        match self.session_bounds(self.local_date(start), extended) {
            Some((open, close)) => open <= start && end <= close,
            None => false,
        }
    }

    pub fn next_trading_day(&self, date: NaiveDate) -> Option<NaiveDate> {
        let mut candidate = date.succ_opt()?;
        for _ in 0..MAX_CALENDAR_SCAN_DAYS {
            if self.is_trading_day(candidate) {
                return Some(candidate);
            }
            candidate = candidate.succ_opt()?;
        }
        None
    }

    /// Smallest period end strictly after `after` that lies inside a session.
    ///
    /// Intraday periods are laid out on a grid anchored at the session open.
    /// Daily periods end at the session close.
    pub fn next_period_end(
        &self,
        after: DateTime<Utc>,
        resolution: Resolution,
        extended: bool,
    ) -> Option<DateTime<Utc>> {
        let period = resolution.period()?;
        let step = period.num_seconds();
        let mut date = self.local_date(after);

        for _ in 0..MAX_CALENDAR_SCAN_DAYS {
            if let Some((open, close)) = self.session_bounds(date, extended) {
                if close > after {
                    let candidate = if resolution == Resolution::Daily {
                        close
                    } else {
                        let periods = if after >= open {
                            (after - open).num_seconds() / step + 1
                        } else {
                            1
                        };
                        open + Duration::seconds(periods * step)
                    };
                    if candidate > after && candidate <= close {
                        return Some(candidate);
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    /// Start of the period that ends at `end`.
    pub fn period_start(
        &self,
        end: DateTime<Utc>,
        resolution: Resolution,
        extended: bool,
    ) -> DateTime<Utc> {
        match resolution {
            Resolution::Daily => self
                .session_bounds(self.local_date(end - Duration::nanoseconds(1)), extended)
                .map(|(open, _)| open)
                .unwrap_or(end - Duration::days(1)),
            _ => end - resolution.period().unwrap_or_else(Duration::zero),
        }
    }
}

/// Named calendars available to subscriptions.
#[derive(Debug, Clone)]
pub struct CalendarRegistry {
    calendars: HashMap<String, Arc<ExchangeCalendar>>,
}

impl CalendarRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            calendars: HashMap::new(),
        };
        let us_equity = Arc::new(ExchangeCalendar::us_equity());
        registry.calendars.insert("us_equity".to_string(), us_equity.clone());
        registry.calendars.insert("nyse".to_string(), us_equity);
        registry.register(ExchangeCalendar::always_open("crypto"));
        registry
    }

    pub fn register(&mut self, calendar: ExchangeCalendar) {
        self.calendars
            .insert(calendar.name.to_lowercase(), Arc::new(calendar));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ExchangeCalendar>> {
        self.calendars.get(&name.to_lowercase()).cloned()
    }
}

impl Default for CalendarRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(cal: &ExchangeCalendar, s: &str) -> DateTime<Utc> {
        let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap();
        cal.local_to_utc(naive)
    }

    #[test]
    fn test_us_equity_session_bounds() {
        let cal = ExchangeCalendar::us_equity();
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let (open, close) = cal.session_bounds(date, false).unwrap();
        assert_eq!(open.to_rfc3339(), "2024-01-02T14:30:00+00:00");
        assert_eq!(close.to_rfc3339(), "2024-01-02T21:00:00+00:00");

        let saturday = NaiveDate::from_ymd_opt(2024, 1, 6).unwrap();
        assert!(cal.session_bounds(saturday, false).is_none());
    }

    #[test]
    fn test_is_open_at_respects_extended_hours() {
        let cal = ExchangeCalendar::us_equity();
        let pre_market = local(&cal, "2024-01-02 08:00");
        assert!(!cal.is_open_at(pre_market, false));
        assert!(cal.is_open_at(pre_market, true));
        assert!(!cal.is_open_at(local(&cal, "2024-01-02 16:00"), false));
    }

    #[test]
    fn test_next_minute_end_rolls_over_weekend() {
        let cal = ExchangeCalendar::us_equity();
        let friday_close = local(&cal, "2024-01-05 16:00");
        let next = cal
            .next_period_end(friday_close, Resolution::Minute, false)
            .unwrap();
        assert_eq!(next, local(&cal, "2024-01-08 09:31"));
    }

    #[test]
    fn test_next_daily_end_skips_holiday() {
        let holiday = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let cal = ExchangeCalendar::us_equity().with_holidays([holiday]);
        let tuesday_close = local(&cal, "2024-01-02 16:00");
        let next = cal
            .next_period_end(tuesday_close, Resolution::Daily, false)
            .unwrap();
        assert_eq!(next, local(&cal, "2024-01-04 16:00"));
    }

    #[test]
    fn test_next_period_end_mid_session() {
        let cal = ExchangeCalendar::us_equity();
        let t = local(&cal, "2024-01-02 10:15") + Duration::seconds(30);
        assert_eq!(
            cal.next_period_end(t, Resolution::Minute, false),
            Some(local(&cal, "2024-01-02 10:16"))
        );
        assert_eq!(
            cal.next_period_end(t, Resolution::Hour, false),
            Some(local(&cal, "2024-01-02 10:30"))
        );
        assert_eq!(cal.next_period_end(t, Resolution::Tick, false), None);
    }

    #[test]
    fn test_always_open_calendar() {
        let cal = ExchangeCalendar::always_open("crypto");
        let sunday = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        assert!(cal.is_trading_day(sunday));
        let t = sunday.and_hms_opt(23, 59, 30).unwrap().and_utc();
        assert_eq!(
            cal.next_period_end(t, Resolution::Daily, false),
            Some(NaiveDate::from_ymd_opt(2024, 1, 8).unwrap().and_hms_opt(0, 0, 0).unwrap().and_utc())
        );
    }

    #[test]
    fn test_period_start_for_daily_bar() {
        let cal = ExchangeCalendar::us_equity();
        let close = local(&cal, "2024-01-02 16:00");
        assert_eq!(
            cal.period_start(close, Resolution::Daily, false),
            local(&cal, "2024-01-02 09:30")
        );
    }

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let registry = CalendarRegistry::new();
        assert!(registry.get("NYSE").is_some());
        assert!(registry.get("crypto").unwrap().always_open);
        assert!(registry.get("lse").is_none());
    }
}
