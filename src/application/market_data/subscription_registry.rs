use crate::application::market_data::subscription_reader::SubscriptionReader;
use crate::domain::errors::SubscriptionError;
use crate::domain::market::calendar::{CalendarRegistry, ExchangeCalendar};
use crate::domain::market::data_point::SubscriptionId;
use crate::domain::market::live_feed::{LiveFeedReceiver, LiveFeedSender, OverflowPolicy, live_feed};
use crate::domain::market::resolution::Resolution;
use crate::domain::market::subscription::{DataKind, Subscription, SubscriptionDescriptor};
use crate::domain::ports::{DataSource, HistoryRequest, LiveDataSource};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Where new subscriptions get their records from.
#[derive(Clone, Default)]
pub struct DataSources {
    pub historical: Option<Arc<dyn DataSource>>,
    pub live: Option<Arc<dyn LiveDataSource>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistrySettings {
    /// Queue depth of the prefetch thread for historical data; 0 reads inline
    pub prefetch_capacity: usize,
    pub live_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            prefetch_capacity: 0,
            live_queue_capacity: 10_000,
            overflow_policy: OverflowPolicy::Block,
        }
    }
}

/// Validates subscription descriptors, assigns ids and opens their readers.
pub struct SubscriptionRegistry {
    calendars: CalendarRegistry,
    sources: DataSources,
    settings: RegistrySettings,
    subscriptions: BTreeMap<SubscriptionId, Arc<Subscription>>,
    next_id: u32,
    window_end: Option<DateTime<Utc>>,
}

impl SubscriptionRegistry {
    pub fn new(calendars: CalendarRegistry, sources: DataSources, settings: RegistrySettings) -> Self {
        Self {
            calendars,
            sources,
            settings,
            subscriptions: BTreeMap::new(),
            next_id: 0,
            window_end: None,
        }
    }

    /// Upper bound for historical requests (backtest end date).
    pub fn with_window_end(mut self, end: Option<DateTime<Utc>>) -> Self {
        self.window_end = end;
        self
    }

    fn validate(&self, descriptor: &SubscriptionDescriptor) -> Result<(), SubscriptionError> {
        if descriptor.symbol.trim().is_empty() {
            return Err(SubscriptionError::EmptySymbol);
        }
        if descriptor.resolution == Resolution::Tick && descriptor.kind == DataKind::TradeBar {
            return Err(SubscriptionError::InvalidResolution {
                resolution: descriptor.resolution.to_string(),
                kind: descriptor.kind.to_string(),
            });
        }
        let duplicate = self.subscriptions.values().any(|s| {
            s.symbol == descriptor.symbol
                && s.resolution == descriptor.resolution
                && s.kind == descriptor.kind
        });
        if duplicate {
            return Err(SubscriptionError::Duplicate {
                symbol: descriptor.symbol.clone(),
                resolution: descriptor.resolution.to_string(),
                kind: descriptor.kind.to_string(),
            });
        }
        Ok(())
    }

    fn register(&mut self, descriptor: SubscriptionDescriptor) -> Result<Arc<Subscription>, SubscriptionError> {
        self.validate(&descriptor)?;
        let calendar = self.calendars.get(&descriptor.calendar).ok_or_else(|| {
            SubscriptionError::UnknownCalendar {
                name: descriptor.calendar.clone(),
            }
        })?;

        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        let subscription = Arc::new(Subscription {
            id,
            symbol: descriptor.symbol,
            resolution: descriptor.resolution,
            kind: descriptor.kind,
            data_time_zone: descriptor.data_time_zone.unwrap_or(calendar.utc_offset),
            calendar,
            fill_forward: descriptor.fill_forward,
            extended_hours: descriptor.extended_hours,
        });
        self.subscriptions.insert(id, subscription.clone());
        info!("SubscriptionRegistry: Added {}", subscription);
        Ok(subscription)
    }

    /// Registers a historical subscription and opens its reader from `start` onward.
    pub fn add(
        &mut self,
        descriptor: SubscriptionDescriptor,
        start: Option<DateTime<Utc>>,
    ) -> Result<(Arc<Subscription>, SubscriptionReader), SubscriptionError> {
        let source = self
            .sources
            .historical
            .clone()
            .ok_or_else(|| SubscriptionError::NoSource {
                mode: "historical".to_string(),
            })?;
        let subscription = self.register(descriptor)?;

        let request = HistoryRequest::for_subscription(&subscription, start, self.window_end);
        let opened = source.fetch(&request).and_then(|records| {
            if self.settings.prefetch_capacity == 0 {
                Ok(SubscriptionReader::historical(records))
            } else {
                let name = subscription.symbol.clone();
                SubscriptionReader::prefetched(&name, records, self.settings.prefetch_capacity)
                    .map_err(anyhow::Error::from)
            }
        });
        match opened {
            Ok(reader) => Ok((subscription, reader)),
            Err(e) => {
                self.subscriptions.remove(&subscription.id);
                Err(SubscriptionError::Source {
                    symbol: subscription.symbol.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Registers a live subscription fed by the configured live source.
    pub fn add_live(
        &mut self,
        descriptor: SubscriptionDescriptor,
    ) -> Result<(Arc<Subscription>, SubscriptionReader), SubscriptionError> {
        let source = self
            .sources
            .live
            .clone()
            .ok_or_else(|| SubscriptionError::NoSource {
                mode: "live".to_string(),
            })?;
        let (subscription, feed, receiver) = self.open_feed(descriptor)?;
        match source.start(&subscription, feed) {
            Ok(handle) => Ok((subscription, SubscriptionReader::live(receiver, handle))),
            Err(e) => {
                self.subscriptions.remove(&subscription.id);
                Err(SubscriptionError::Source {
                    symbol: subscription.symbol.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Registers a live subscription whose records the caller pushes directly.
    pub fn add_live_feed(
        &mut self,
        descriptor: SubscriptionDescriptor,
    ) -> Result<(Arc<Subscription>, LiveFeedSender, SubscriptionReader), SubscriptionError> {
        let (subscription, feed, receiver) = self.open_feed(descriptor)?;
        let reader = SubscriptionReader::live(receiver, Default::default());
        Ok((subscription, feed, reader))
    }

    fn open_feed(
        &mut self,
        descriptor: SubscriptionDescriptor,
    ) -> Result<(Arc<Subscription>, LiveFeedSender, LiveFeedReceiver), SubscriptionError> {
        let subscription = self.register(descriptor)?;
        let (feed, receiver) = live_feed(
            subscription.id,
            &subscription.symbol,
            self.settings.live_queue_capacity,
            self.settings.overflow_policy,
        );
        Ok((subscription, feed, receiver))
    }

    pub fn remove(&mut self, id: SubscriptionId) -> Result<Arc<Subscription>, SubscriptionError> {
        let removed = self
            .subscriptions
            .remove(&id)
            .ok_or(SubscriptionError::NotFound(id))?;
        info!("SubscriptionRegistry: Removed {}", removed);
        Ok(removed)
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&Arc<Subscription>> {
        self.subscriptions.get(&id)
    }

    pub fn find(&self, symbol: &str) -> impl Iterator<Item = &Arc<Subscription>> {
        self.subscriptions.values().filter(move |s| s.symbol == symbol)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Sorted, de-duplicated symbols of all active subscriptions.
    pub fn universe(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.subscriptions.values().map(|s| s.symbol.clone()).collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// The calendar that drives session boundaries: the first subscription's.
    pub fn primary_calendar(&self) -> Option<Arc<ExchangeCalendar>> {
        self.subscriptions.values().next().map(|s| s.calendar.clone())
    }
}
