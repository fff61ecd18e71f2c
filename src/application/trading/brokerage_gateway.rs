use crate::domain::errors::BrokerageError;
use crate::domain::market::slice::Slice;
use crate::domain::ports::Brokerage;
use crate::domain::trading::order::Order;
use crate::domain::trading::types::{BrokerEvent, BrokerOrder, RejectReason, UpdateOrderFields};
use crate::infrastructure::core::circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tracing::{error, info, warn};

/// Bounded exponential backoff for idempotent calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub circuit_failure_threshold: usize,
    pub circuit_reset: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            circuit_failure_threshold: 5,
            circuit_reset: Duration::from_secs(30),
        }
    }
}

/// What is known about a new order after handing it to the venue.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Accepted,
    /// The venue refused it, or the request never left the engine
    Rejected { reason: RejectReason, message: String },
    /// Timed out or failed in transit; the venue may or may not have the order
    Uncertain(BrokerageError),
}

/// Wraps a [`Brokerage`] with call timeouts, retries for idempotent calls and a
/// circuit breaker. Submissions and updates are attempted exactly once.
pub struct BrokerageGateway {
    brokerage: Arc<dyn Brokerage>,
    breaker: CircuitBreaker,
    settings: GatewaySettings,
}

impl BrokerageGateway {
    pub fn new(brokerage: Arc<dyn Brokerage>, settings: GatewaySettings) -> Self {
        let breaker = CircuitBreaker::new(
            brokerage.name().to_string(),
            settings.circuit_failure_threshold,
            1,
            settings.circuit_reset,
        );
        Self {
            brokerage,
            breaker,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        self.brokerage.name()
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.breaker.state().await
    }

    async fn guarded<T, F>(&self, operation: &str, call: F) -> Result<T, BrokerageError>
    where
        F: Future<Output = Result<T, BrokerageError>>,
    {
        let timeout = self.settings.call_timeout;
        let timed = async {
            match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(BrokerageError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            }
        };
        match self.breaker.call(timed, BrokerageError::is_retryable).await {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::Open(message)) => Err(BrokerageError::CircuitOpen(message)),
            Err(CircuitBreakerError::Inner(e)) => Err(e),
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, BrokerageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerageError>>,
    {
        let policy = self.settings.retry;
        let mut attempt = 0;
        loop {
            match self.guarded(operation, call()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                    attempt += 1;
                    let delay = policy.delay_for(attempt);
                    warn!(
                        "BrokerageGateway [{}]: {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        self.name(),
                        operation,
                        attempt,
                        policy.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        "BrokerageGateway [{}]: {} failed after {} attempts: {}",
                        self.name(),
                        operation,
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    pub async fn connect(&self) -> Result<(), BrokerageError> {
        self.with_retry("connect", || self.brokerage.connect()).await?;
        info!("BrokerageGateway [{}]: Connected", self.name());
        Ok(())
    }

    pub async fn submit(&self, order: &Order) -> SubmitOutcome {
        match self.guarded("submit", self.brokerage.submit(order)).await {
            Ok(()) => SubmitOutcome::Accepted,
            Err(BrokerageError::Rejected { reason, message }) => {
                SubmitOutcome::Rejected { reason, message }
            }
            Err(BrokerageError::CircuitOpen(message)) => SubmitOutcome::Rejected {
                reason: RejectReason::VenueError,
                message: format!("not sent, circuit open: {}", message),
            },
            Err(e) => SubmitOutcome::Uncertain(e),
        }
    }

    pub async fn cancel(&self, order: &Order) -> Result<(), BrokerageError> {
        self.with_retry("cancel", || self.brokerage.cancel(order)).await
    }

    pub async fn update(&self, order: &Order, fields: &UpdateOrderFields) -> Result<(), BrokerageError> {
        match self.guarded("update", self.brokerage.update(order, fields)).await {
            // Never sent, so the venue state is known
            Err(BrokerageError::CircuitOpen(message)) => Err(BrokerageError::Rejected {
                reason: RejectReason::VenueError,
                message: format!("not sent, circuit open: {}", message),
            }),
            other => other,
        }
    }

    pub async fn open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerageError> {
        self.with_retry("get_open_orders", || self.brokerage.get_open_orders())
            .await
    }

    pub async fn recent_orders(&self) -> Result<Vec<BrokerOrder>, BrokerageError> {
        self.with_retry("get_recent_orders", || self.brokerage.get_recent_orders())
            .await
    }

    pub async fn subscribe_events(&self) -> Result<Receiver<BrokerEvent>, BrokerageError> {
        self.with_retry("subscribe_events", || self.brokerage.subscribe_events())
            .await
    }

    pub async fn on_slice(&self, slice: &Slice) -> Result<(), BrokerageError> {
        self.guarded("on_slice", self.brokerage.on_slice(slice)).await
    }
}
