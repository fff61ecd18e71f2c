use crate::domain::market::calendar::ExchangeCalendar;
use crate::domain::market::data_point::MarketRecord;
use crate::domain::market::live_feed::{IngestionHandle, LiveFeedSender};
use crate::domain::market::resolution::Resolution;
use crate::domain::market::subscription::Subscription;
use crate::domain::ports::LiveDataSource;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, info};

/// Seeded random walk producing the same records for the same seed on every platform.
#[derive(Debug, Clone)]
pub struct SyntheticSeries {
    state: u64,
    price: f64,
    drift: f64,
    volatility: f64,
}

impl SyntheticSeries {
    pub fn new(seed: u64, start_price: f64) -> Self {
        Self {
            state: seed,
            price: start_price,
            drift: 0.0003,
            volatility: 0.02,
        }
    }

    pub fn with_drift(mut self, drift: f64) -> Self {
        self.drift = drift;
        self
    }

    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = volatility;
        self
    }

    /// Uniform sample in [0, 1)
    fn next_uniform(&mut self) -> f64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.state >> 11) as f64 / (1u64 << 53) as f64
    }

    fn step(&mut self) -> (f64, f64, f64, f64, f64) {
        let open = self.price;
        let shock = 2.0 * self.next_uniform() - 1.0;
        let close = (open * (1.0 + self.drift + self.volatility * shock)).max(0.01);
        let high = open.max(close) * (1.0 + self.volatility * 0.5 * self.next_uniform());
        let low = open.min(close) * (1.0 - self.volatility * 0.5 * self.next_uniform());
        let volume = 100_000.0 + 900_000.0 * self.next_uniform();
        self.price = close;
        (open, high, low.max(0.01), close, volume)
    }

    fn decimal(value: f64, scale: u32) -> Decimal {
        Decimal::from_f64(value)
            .unwrap_or(Decimal::ZERO)
            .round_dp(scale)
    }

    /// Next tick price, rounded to cents.
    pub fn next_price(&mut self) -> Decimal {
        let (_, _, _, close, _) = self.step();
        Self::decimal(close, 2)
    }

    /// `count` consecutive in-session bars after `from`, timestamped in the calendar's offset.
    pub fn bars(
        &mut self,
        calendar: &ExchangeCalendar,
        resolution: Resolution,
        from: DateTime<Utc>,
        count: usize,
    ) -> Vec<MarketRecord> {
        let mut records = Vec::with_capacity(count);
        let mut after = from;
        while records.len() < count {
            let Some(end) = calendar.next_period_end(after, resolution, false) else {
                break;
            };
            let start = calendar.period_start(end, resolution, false);
            let (open, high, low, close, volume) = self.step();
            records.push(MarketRecord::bar(
                to_local(start, calendar.utc_offset),
                to_local(end, calendar.utc_offset),
                Self::decimal(open, 2),
                Self::decimal(high, 2),
                Self::decimal(low, 2),
                Self::decimal(close, 2),
                Self::decimal(volume, 0),
            ));
            after = end;
        }
        records
    }
}

fn to_local(time: DateTime<Utc>, offset: FixedOffset) -> NaiveDateTime {
    time.with_timezone(&offset).naive_local()
}

/// Live source that pushes synthetic records from one thread per subscription.
///
/// Tick subscriptions get a tick every `tick_interval`; bar subscriptions get a bar
/// each time the wall clock passes the next period end of the subscription's calendar.
pub struct SyntheticLiveSource {
    seed: u64,
    start_price: f64,
    tick_interval: std::time::Duration,
}

impl SyntheticLiveSource {
    pub fn new(seed: u64, start_price: f64, tick_interval: std::time::Duration) -> Self {
        Self {
            seed,
            start_price,
            tick_interval,
        }
    }
}

impl LiveDataSource for SyntheticLiveSource {
    fn start(&self, subscription: &Subscription, feed: LiveFeedSender) -> Result<IngestionHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let subscription = subscription.clone();
        let mut series =
            SyntheticSeries::new(self.seed ^ u64::from(subscription.id.0), self.start_price);
        let interval = self.tick_interval;

        let thread = thread::Builder::new()
            .name(format!("synthetic-{}", subscription.symbol))
            .spawn(move || {
                info!("SyntheticLiveSource: streaming {}", subscription);
                let mut next_end = subscription.next_expected_end(Utc::now());
                while !thread_stop.load(Ordering::Acquire) && !feed.is_stopped() {
                    thread::sleep(interval);
                    let now = Utc::now();
                    let record = match subscription.resolution {
                        Resolution::Tick => {
                            let local = to_local(now, subscription.data_time_zone);
                            Some(MarketRecord::tick(local, series.next_price(), Decimal::ONE))
                        }
                        _ => match next_end {
                            Some(end) if end <= now => {
                                let bar = series
                                    .bars(
                                        &subscription.calendar,
                                        subscription.resolution,
                                        end - Duration::nanoseconds(1),
                                        1,
                                    )
                                    .pop();
                                next_end = subscription.next_expected_end(end);
                                bar
                            }
                            _ => None,
                        },
                    };
                    if let Some(record) = record
                        && feed.send(record).is_err()
                    {
                        break;
                    }
                }
                debug!("SyntheticLiveSource: {} stopped", subscription.symbol);
            })
            .context("Failed to spawn synthetic ingestion thread")?;

        Ok(IngestionHandle::new(stop, Some(thread)))
    }
}
