use crate::domain::market::data_point::SubscriptionId;
use crate::domain::trading::types::{OrderId, RejectReason};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

/// Diagnostics produced while a run is in progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RunEvent {
    SubscriptionStale {
        subscription: SubscriptionId,
        symbol: String,
        since: DateTime<Utc>,
        missing_periods: u32,
    },
    SubscriptionResumed {
        subscription: SubscriptionId,
        symbol: String,
        at: DateTime<Utc>,
    },
    OutOfOrderData {
        subscription: SubscriptionId,
        symbol: String,
        end_time: DateTime<Utc>,
        frontier: DateTime<Utc>,
    },
    QueueOverflow {
        subscription: SubscriptionId,
        dropped: u64,
    },
    OrderRejected {
        order_id: OrderId,
        symbol: String,
        reason: RejectReason,
        message: String,
    },
    ReconciliationMismatch {
        order_id: OrderId,
        detail: String,
    },
    SynchronizationStall {
        waited_ms: u64,
        consecutive: u32,
    },
    MarginViolation {
        cash: Decimal,
        reserved: Decimal,
    },
    DroppedBrokerEvent {
        order_id: OrderId,
        reason: String,
    },
    SubmissionUncertain {
        order_id: OrderId,
        detail: String,
    },
}

pub trait RunEventListener: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

/// Writes every run event to the log.
pub struct LoggingListener;

impl RunEventListener for LoggingListener {
    fn on_event(&self, event: &RunEvent) {
        match event {
            RunEvent::SubscriptionResumed { .. } => info!("RunEvent: {:?}", event),
            _ => warn!("RunEvent: {:?}", event),
        }
    }
}
