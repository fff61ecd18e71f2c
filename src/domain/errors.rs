use crate::domain::diagnostics::DiagnosticSnapshot;
use crate::domain::market::data_point::SubscriptionId;
use crate::domain::strategy::models::PipelineStage;
use crate::domain::trading::types::{OrderId, OrderStatus, RejectReason};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Engine-level failures surfaced to the run driver.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Data integrity violation on {symbol} ({subscription}): {reason}")]
    DataIntegrity {
        subscription: SubscriptionId,
        symbol: String,
        reason: String,
    },

    #[error("Subscription {subscription} ({symbol}) stale since {since}: {missing_periods} periods without data")]
    SubscriptionStale {
        subscription: SubscriptionId,
        symbol: String,
        since: DateTime<Utc>,
        missing_periods: u32,
    },

    #[error("Order {order_id} rejected: {reason} ({message})")]
    OrderRejected {
        order_id: OrderId,
        reason: RejectReason,
        message: String,
    },

    #[error("Reconciliation mismatch for order {order_id}: {detail}")]
    ReconciliationMismatch { order_id: OrderId, detail: String },

    #[error("Synchronization stalled for {waited_ms}ms ({consecutive} consecutive)")]
    SynchronizationStall { waited_ms: u64, consecutive: u32 },

    #[error("Strategy fault in {stage} stage: {message}")]
    StrategyFault {
        stage: PipelineStage,
        message: String,
        snapshot: Box<DiagnosticSnapshot>,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Brokerage(#[from] BrokerageError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl EngineError {
    /// Errors that end the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::DataIntegrity { .. }
                | EngineError::StrategyFault { .. }
                | EngineError::SynchronizationStall { .. }
                | EngineError::Brokerage(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("Subscription symbol must not be empty")]
    EmptySymbol,

    #[error("Unknown exchange calendar: {name}")]
    UnknownCalendar { name: String },

    #[error("Resolution {resolution} is not valid for {kind} data")]
    InvalidResolution { resolution: String, kind: String },

    #[error("Duplicate subscription for {symbol} {resolution} {kind}")]
    Duplicate {
        symbol: String,
        resolution: String,
        kind: String,
    },

    #[error("Subscription not found: {0}")]
    NotFound(SubscriptionId),

    #[error("No data source configured for {mode} subscriptions")]
    NoSource { mode: String },

    #[error("Data source failed for {symbol}: {message}")]
    Source { symbol: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerageError {
    #[error("Brokerage {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Transient brokerage failure during {operation}: {message}")]
    Transient { operation: String, message: String },

    #[error("Brokerage rejected request: {reason} ({message})")]
    Rejected {
        reason: RejectReason,
        message: String,
    },

    #[error("Brokerage circuit open: {0}")]
    CircuitOpen(String),

    #[error("Brokerage not connected")]
    NotConnected,

    #[error("Brokerage event stream closed")]
    EventStreamClosed,
}

impl BrokerageError {
    /// Failures worth retrying for idempotent calls.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerageError::Timeout { .. }
                | BrokerageError::Transient { .. }
                | BrokerageError::NotConnected
                | BrokerageError::EventStreamClosed
        )
    }

    /// The venue answered; the request itself was refused.
    pub fn is_definitive(&self) -> bool {
        matches!(self, BrokerageError::Rejected { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("Unknown order: {0}")]
    UnknownOrder(OrderId),

    #[error("Invalid transition for order {order_id}: {from} -> {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("Order {order_id} is terminal ({status})")]
    TerminalOrder {
        order_id: OrderId,
        status: OrderStatus,
    },

    #[error("Invalid request for order {order_id}: {reason}")]
    InvalidRequest { order_id: OrderId, reason: String },
}
