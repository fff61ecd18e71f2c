use crate::domain::diagnostics::RunSummary;
use crate::domain::errors::BrokerageError;
use crate::domain::market::data_point::MarketRecord;
use crate::domain::market::live_feed::{IngestionHandle, LiveFeedSender};
use crate::domain::market::resolution::Resolution;
use crate::domain::market::slice::Slice;
use crate::domain::market::subscription::{DataKind, Subscription};
use crate::domain::trading::order::Order;
use crate::domain::trading::portfolio::Portfolio;
use crate::domain::trading::types::{
    BrokerEvent, BrokerOrder, EquityPoint, OrderEvent, TradeRecord, UpdateOrderFields,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use tokio::sync::mpsc::Receiver;

/// Historical query for one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRequest {
    pub symbol: String,
    pub resolution: Resolution,
    pub kind: DataKind,
    pub data_time_zone: FixedOffset,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl HistoryRequest {
    pub fn for_subscription(
        subscription: &Subscription,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            symbol: subscription.symbol.clone(),
            resolution: subscription.resolution,
            kind: subscription.kind,
            data_time_zone: subscription.data_time_zone,
            start,
            end,
        }
    }

    fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        (local - Duration::seconds(i64::from(self.data_time_zone.local_minus_utc()))).and_utc()
    }

    /// True when the record's end time falls inside the requested window.
    pub fn contains(&self, record: &MarketRecord) -> bool {
        let end = self.to_utc(record.end_time);
        self.start.is_none_or(|start| end > start) && self.end.is_none_or(|stop| end <= stop)
    }
}

/// Source of historical records, ordered by time per request.
pub trait DataSource: Send + Sync {
    fn fetch(
        &self,
        request: &HistoryRequest,
    ) -> Result<Box<dyn Iterator<Item = MarketRecord> + Send>>;
}

/// Source of pushed records for live runs.
pub trait LiveDataSource: Send + Sync {
    /// Starts ingestion for a subscription; records are pushed into `feed`.
    fn start(&self, subscription: &Subscription, feed: LiveFeedSender) -> Result<IngestionHandle>;
}

/// Trading venue. Every call may be slow or fail.
#[async_trait]
pub trait Brokerage: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), BrokerageError>;

    async fn submit(&self, order: &Order) -> Result<(), BrokerageError>;

    async fn cancel(&self, order: &Order) -> Result<(), BrokerageError>;

    async fn update(&self, order: &Order, fields: &UpdateOrderFields) -> Result<(), BrokerageError>;

    async fn get_open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerageError>;

    /// Recently completed orders, used to resolve orders missing from the open set
    async fn get_recent_orders(&self) -> Result<Vec<BrokerOrder>, BrokerageError>;

    async fn subscribe_events(&self) -> Result<Receiver<BrokerEvent>, BrokerageError>;

    /// Market data notification for venues that simulate matching locally.
    async fn on_slice(&self, _slice: &Slice) -> Result<(), BrokerageError> {
        Ok(())
    }
}

/// Write-only results collaborator.
pub trait ResultsSink: Send + Sync {
    fn record_equity(&self, point: EquityPoint);

    fn record_trade(&self, trade: TradeRecord);

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Strategy callbacks outside the pipeline.
pub trait StrategyHooks: Send {
    fn on_order_event(&mut self, _event: &OrderEvent, _portfolio: &Portfolio) {}

    /// Called on the first slice of each trading date of the primary calendar.
    fn on_session_boundary(&mut self, _date: NaiveDate, _portfolio: &Portfolio) {}

    fn on_end_of_run(&mut self, _summary: &RunSummary, _portfolio: &Portfolio) {}
}

pub struct NoopHooks;

impl StrategyHooks for NoopHooks {}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}
