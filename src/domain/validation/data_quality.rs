use crate::domain::market::data_point::{Bar, MarketRecord, MarketValue, Quote, Tick};
use rust_decimal::Decimal;

/// Centralized validator for ingested market records.
///
/// Rejects data that is physically impossible. Callers treat a rejection as a
/// data integrity failure of the owning subscription.
pub struct StrictRecordValidator;

impl StrictRecordValidator {
    /// Returns a description of the first problem found, if any.
    pub fn validate(record: &MarketRecord) -> Result<(), String> {
        if record.end_time < record.time {
            return Err(format!(
                "end time {} precedes start time {}",
                record.end_time, record.time
            ));
        }
        match &record.value {
            MarketValue::Bar(bar) => Self::validate_bar(bar),
            MarketValue::Tick(tick) => Self::validate_tick(tick),
            MarketValue::Quote(quote) => Self::validate_quote(quote),
        }
    }

    fn validate_bar(bar: &Bar) -> Result<(), String> {
        if bar.open <= Decimal::ZERO
            || bar.high <= Decimal::ZERO
            || bar.low <= Decimal::ZERO
            || bar.close <= Decimal::ZERO
        {
            return Err("bar has non-positive price component(s)".to_string());
        }
        if bar.low > bar.high {
            return Err(format!("bar low {} > high {}", bar.low, bar.high));
        }
        if bar.volume < Decimal::ZERO {
            return Err(format!("bar has negative volume {}", bar.volume));
        }
        Ok(())
    }

    fn validate_tick(tick: &Tick) -> Result<(), String> {
        if tick.price <= Decimal::ZERO {
            return Err(format!("tick has non-positive price {}", tick.price));
        }
        if tick.size < Decimal::ZERO {
            return Err(format!("tick has negative size {}", tick.size));
        }
        Ok(())
    }

    fn validate_quote(quote: &Quote) -> Result<(), String> {
        if quote.bid <= Decimal::ZERO || quote.ask <= Decimal::ZERO {
            return Err("quote has non-positive bid or ask".to_string());
        }
        if quote.bid > quote.ask {
            return Err(format!("crossed quote: bid {} > ask {}", quote.bid, quote.ask));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use rust_decimal_macros::dec;

    fn t() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    #[test]
    fn test_valid_bar_passes() {
        let record = MarketRecord::bar(
            t(),
            t() + Duration::minutes(1),
            dec!(100),
            dec!(101),
            dec!(99),
            dec!(100.5),
            dec!(1000),
        );
        assert!(StrictRecordValidator::validate(&record).is_ok());
    }

    #[test]
    fn test_inverted_bar_fails() {
        let record = MarketRecord::bar(
            t(),
            t() + Duration::minutes(1),
            dec!(100),
            dec!(99),
            dec!(101),
            dec!(100),
            dec!(10),
        );
        let err = StrictRecordValidator::validate(&record).unwrap_err();
        assert!(err.contains("low"));
    }

    #[test]
    fn test_end_before_start_fails() {
        let mut record = MarketRecord::tick(t(), dec!(10), dec!(1));
        record.end_time = t() - Duration::seconds(1);
        assert!(StrictRecordValidator::validate(&record).is_err());
    }

    #[test]
    fn test_crossed_quote_fails() {
        let record = MarketRecord::quote(t(), dec!(10.01), dec!(10.00));
        assert!(StrictRecordValidator::validate(&record).is_err());
        let ok = MarketRecord::quote(t(), dec!(10.00), dec!(10.01));
        assert!(StrictRecordValidator::validate(&ok).is_ok());
    }
}
