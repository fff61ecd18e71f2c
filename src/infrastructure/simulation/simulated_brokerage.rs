//! Paper venue that matches orders against slices.
//!
//! Used by backtests and by tests that need a venue with scripted failures: lost
//! acknowledgments, dropped connections, failing calls.

use crate::domain::errors::BrokerageError;
use crate::domain::market::slice::Slice;
use crate::domain::ports::Brokerage;
use crate::domain::trading::fee_model::{ConstantFeeModel, FeeModel};
use crate::domain::trading::order::Order;
use crate::domain::trading::types::{
    BrokerEvent, BrokerOrder, FillEvent, OrderId, OrderSide, OrderStatus, OrderType, RejectReason,
    UpdateOrderFields,
};
use crate::infrastructure::simulation::slippage_model::{NoSlippage, SlippageModel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::Signed;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tracing::{debug, info, warn};

const RECENT_ORDERS_KEPT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedOperation {
    Connect,
    Submit,
    Cancel,
    Update,
    OpenOrders,
    RecentOrders,
    Subscribe,
}

#[derive(Debug, Clone)]
pub struct SimulatedBrokerageSettings {
    pub event_capacity: usize,
    /// Share of the remaining quantity filled per slice; 1 fills completely
    pub max_fill_fraction: Decimal,
}

impl Default for SimulatedBrokerageSettings {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            max_fill_fraction: Decimal::ONE,
        }
    }
}

#[derive(Debug, Clone)]
struct WorkingOrder {
    order: BrokerOrder,
    stop_triggered: bool,
}

#[derive(Default)]
struct VenueState {
    connected: bool,
    sender: Option<Sender<BrokerEvent>>,
    backlog: VecDeque<BrokerEvent>,
    /// Keyed by venue sequence so matching order is deterministic
    working: BTreeMap<u64, WorkingOrder>,
    recent: VecDeque<BrokerOrder>,
    next_sequence: u64,
    next_fill: u64,
    failures: HashMap<SimulatedOperation, VecDeque<BrokerageError>>,
    lost_acks: u32,
    lost_events: u64,
}

impl VenueState {
    fn take_failure(&mut self, operation: SimulatedOperation) -> Result<(), BrokerageError> {
        match self.failures.get_mut(&operation).and_then(|q| q.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn ensure_connected(&self) -> Result<(), BrokerageError> {
        if self.connected {
            Ok(())
        } else {
            Err(BrokerageError::NotConnected)
        }
    }

    /// Delivers backlog first, then `event`. Events are lost while disconnected.
    fn emit(&mut self, event: BrokerEvent) {
        self.backlog.push_back(event);
        let Some(sender) = self.sender.clone() else {
            self.lost_events += self.backlog.len() as u64;
            self.backlog.clear();
            return;
        };
        while let Some(next) = self.backlog.pop_front() {
            match sender.try_send(next) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.backlog.push_front(event);
                    debug!(
                        "SimulatedBrokerage: Event channel full, {} events held back",
                        self.backlog.len()
                    );
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    self.sender = None;
                    self.lost_events += self.backlog.len() as u64 + 1;
                    self.backlog.clear();
                    return;
                }
            }
        }
    }

    fn find_working(&self, order: &Order) -> Option<u64> {
        self.working
            .iter()
            .find(|(_, w)| {
                w.order.order_id == Some(order.id)
                    || order.broker_id.as_deref() == Some(w.order.broker_id.as_str())
            })
            .map(|(sequence, _)| *sequence)
    }

    fn archive(&mut self, order: BrokerOrder) {
        self.recent.push_back(order);
        while self.recent.len() > RECENT_ORDERS_KEPT {
            self.recent.pop_front();
        }
    }
}

/// Prices an order may trade at within one slice.
#[derive(Debug, Clone, Copy)]
struct PriceRange {
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
}

impl PriceRange {
    fn from_slice(slice: &Slice, symbol: &str) -> Option<Self> {
        if let Some(bar) = slice.bars(symbol).next() {
            return Some(Self {
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
            });
        }
        slice.price(symbol).map(|price| Self {
            open: price,
            high: price,
            low: price,
            close: price,
        })
    }
}

pub struct SimulatedBrokerage {
    name: String,
    fee_model: Arc<dyn FeeModel>,
    slippage: Arc<dyn SlippageModel>,
    settings: SimulatedBrokerageSettings,
    state: Mutex<VenueState>,
}

impl SimulatedBrokerage {
    pub fn new(settings: SimulatedBrokerageSettings) -> Self {
        Self {
            name: "simulated".to_string(),
            fee_model: Arc::new(ConstantFeeModel::zero()),
            slippage: Arc::new(NoSlippage),
            settings,
            state: Mutex::new(VenueState::default()),
        }
    }

    pub fn with_fee_model(mut self, fee_model: Arc<dyn FeeModel>) -> Self {
        self.fee_model = fee_model;
        self
    }

    pub fn with_slippage(mut self, slippage: Arc<dyn SlippageModel>) -> Self {
        self.slippage = slippage;
        self
    }

    /// Makes the next call of `operation` fail with `error`.
    pub async fn fail_next(&self, operation: SimulatedOperation, error: BrokerageError) {
        let mut state = self.state.lock().await;
        state.failures.entry(operation).or_default().push_back(error);
    }

    /// The next submission is accepted by the venue but the caller sees a timeout.
    pub async fn lose_next_ack(&self) {
        self.state.lock().await.lost_acks += 1;
    }

    /// Closes the event stream; working orders stay at the venue and keep matching.
    pub async fn drop_connection(&self) {
        let mut state = self.state.lock().await;
        state.connected = false;
        state.sender = None;
        warn!("SimulatedBrokerage: Connection dropped");
    }

    /// Events that could not be delivered because no stream was attached.
    pub async fn lost_events(&self) -> u64 {
        self.state.lock().await.lost_events
    }

    fn fill_price(&self, working: &mut WorkingOrder, range: PriceRange) -> Option<Decimal> {
        let order = working.order.clone();
        let side = if order.quantity.is_sign_negative() {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };

        if let Some(stop) = order.stop_price
            && !working.stop_triggered
        {
            let triggered = match side {
                OrderSide::Buy => range.high >= stop,
                OrderSide::Sell => range.low <= stop,
            };
            if !triggered {
                return None;
            }
            working.stop_triggered = true;
        }

        let reference = match order.order_type {
            OrderType::Market | OrderType::MarketOnOpen => range.open,
            OrderType::MarketOnClose => range.close,
            OrderType::StopMarket => {
                let stop = order.stop_price.unwrap_or(range.open);
                match side {
                    OrderSide::Buy => range.open.max(stop),
                    OrderSide::Sell => range.open.min(stop),
                }
            }
            OrderType::Limit | OrderType::StopLimit => {
                let limit = order.limit_price?;
                return match side {
                    OrderSide::Buy if range.low <= limit => Some(range.open.min(limit)),
                    OrderSide::Sell if range.high >= limit => Some(range.open.max(limit)),
                    _ => None,
                };
            }
        };
        Some(
            self.slippage
                .execution_price(reference, order.quantity.abs(), side),
        )
    }

    fn fill_quantity(&self, remaining: Decimal) -> Decimal {
        if self.settings.max_fill_fraction >= Decimal::ONE {
            return remaining;
        }
        let partial = (remaining.abs() * self.settings.max_fill_fraction).floor();
        if partial.is_zero() {
            remaining
        } else {
            partial.min(remaining.abs()) * remaining.signum()
        }
    }
}

#[async_trait]
impl Brokerage for SimulatedBrokerage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), BrokerageError> {
        let mut state = self.state.lock().await;
        state.take_failure(SimulatedOperation::Connect)?;
        state.connected = true;
        info!("SimulatedBrokerage: Connected");
        Ok(())
    }

    async fn submit(&self, order: &Order) -> Result<(), BrokerageError> {
        let mut state = self.state.lock().await;
        state.take_failure(SimulatedOperation::Submit)?;
        state.ensure_connected()?;

        if order.quantity.is_zero() {
            return Err(BrokerageError::Rejected {
                reason: RejectReason::InvalidOrder,
                message: "zero quantity".to_string(),
            });
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        let broker_id = format!("SIM-{}", sequence);
        state.working.insert(
            sequence,
            WorkingOrder {
                order: BrokerOrder {
                    order_id: Some(order.id),
                    broker_id: broker_id.clone(),
                    symbol: order.symbol.clone(),
                    quantity: order.quantity,
                    filled_quantity: Decimal::ZERO,
                    average_fill_price: Decimal::ZERO,
                    status: OrderStatus::Submitted,
                    order_type: order.order_type,
                    limit_price: order.limit_price,
                    stop_price: order.stop_price,
                },
                stop_triggered: false,
            },
        );
        debug!(
            "SimulatedBrokerage: Accepted {} as {} ({} {})",
            order.id, broker_id, order.quantity, order.symbol
        );

        if state.lost_acks > 0 {
            state.lost_acks -= 1;
            warn!("SimulatedBrokerage: Acknowledgment for {} lost", order.id);
            return Err(BrokerageError::Timeout {
                operation: "submit".to_string(),
                timeout_ms: 0,
            });
        }
        state.emit(BrokerEvent::Acknowledged {
            order_id: order.id,
            broker_id,
            time: order.submit_time,
        });
        Ok(())
    }

    async fn cancel(&self, order: &Order) -> Result<(), BrokerageError> {
        let mut state = self.state.lock().await;
        state.take_failure(SimulatedOperation::Cancel)?;
        state.ensure_connected()?;

        let Some(sequence) = state.find_working(order) else {
            return Err(BrokerageError::Rejected {
                reason: RejectReason::InvalidOrder,
                message: format!("order {} is not working", order.id),
            });
        };
        if let Some(mut working) = state.working.remove(&sequence) {
            working.order.status = OrderStatus::Canceled;
            state.archive(working.order);
        }
        state.emit(BrokerEvent::Canceled {
            order_id: order.id,
            time: order.last_update,
        });
        Ok(())
    }

    async fn update(&self, order: &Order, fields: &UpdateOrderFields) -> Result<(), BrokerageError> {
        let mut state = self.state.lock().await;
        state.take_failure(SimulatedOperation::Update)?;
        state.ensure_connected()?;

        let Some(sequence) = state.find_working(order) else {
            return Err(BrokerageError::Rejected {
                reason: RejectReason::InvalidOrder,
                message: format!("order {} is not working", order.id),
            });
        };
        let Some(working) = state.working.get_mut(&sequence) else {
            return Err(BrokerageError::NotConnected);
        };
        if let Some(quantity) = fields.quantity
            && quantity.abs() < working.order.filled_quantity.abs()
        {
            state.emit(BrokerEvent::UpdateRejected {
                order_id: order.id,
                message: "quantity below filled".to_string(),
                time: order.last_update,
            });
            return Ok(());
        }
        if let Some(quantity) = fields.quantity {
            working.order.quantity = quantity;
        }
        if fields.limit_price.is_some() {
            working.order.limit_price = fields.limit_price;
        }
        if fields.stop_price.is_some() {
            working.order.stop_price = fields.stop_price;
        }
        state.emit(BrokerEvent::UpdateAcknowledged {
            order_id: order.id,
            time: order.last_update,
        });
        Ok(())
    }

    async fn get_open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerageError> {
        let mut state = self.state.lock().await;
        state.take_failure(SimulatedOperation::OpenOrders)?;
        state.ensure_connected()?;
        Ok(state.working.values().map(|w| w.order.clone()).collect())
    }

    async fn get_recent_orders(&self) -> Result<Vec<BrokerOrder>, BrokerageError> {
        let mut state = self.state.lock().await;
        state.take_failure(SimulatedOperation::RecentOrders)?;
        state.ensure_connected()?;
        Ok(state.recent.iter().cloned().collect())
    }

    async fn subscribe_events(&self) -> Result<Receiver<BrokerEvent>, BrokerageError> {
        let mut state = self.state.lock().await;
        state.take_failure(SimulatedOperation::Subscribe)?;
        state.ensure_connected()?;
        let (sender, receiver) = mpsc::channel(self.settings.event_capacity.max(1));
        state.sender = Some(sender);
        Ok(receiver)
    }

    /// Matches working orders against the slice. Runs whether or not a stream is attached.
    async fn on_slice(&self, slice: &Slice) -> Result<(), BrokerageError> {
        let mut state = self.state.lock().await;
        let time: DateTime<Utc> = slice.time();
        let sequences: Vec<u64> = state.working.keys().copied().collect();

        for sequence in sequences {
            let Some(mut working) = state.working.remove(&sequence) else {
                continue;
            };
            let Some(range) = PriceRange::from_slice(slice, &working.order.symbol) else {
                state.working.insert(sequence, working);
                continue;
            };
            let Some(price) = self.fill_price(&mut working, range) else {
                state.working.insert(sequence, working);
                continue;
            };

            let remaining = working.order.quantity - working.order.filled_quantity;
            let quantity = self.fill_quantity(remaining);
            let fee = self.fee_model.fee(quantity.abs(), price);
            let order = &mut working.order;
            let filled = order.filled_quantity + quantity;
            order.average_fill_price =
                (order.filled_quantity * order.average_fill_price + quantity * price) / filled;
            order.filled_quantity = filled;
            order.status = if filled == order.quantity {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };

            state.next_fill += 1;
            let fill_id = format!("SIM-F{}", state.next_fill);
            let order_id: OrderId = match order.order_id {
                Some(id) => id,
                None => {
                    state.working.insert(sequence, working);
                    continue;
                }
            };
            debug!(
                "SimulatedBrokerage: {} filled {} @ {} ({})",
                order.broker_id, quantity, price, order.status
            );
            let completed = order.status == OrderStatus::Filled;
            state.emit(BrokerEvent::Filled(FillEvent {
                order_id,
                fill_id,
                quantity,
                cumulative_quantity: filled,
                price,
                fee,
                time,
            }));
            if completed {
                state.archive(working.order);
            } else {
                state.working.insert(sequence, working);
            }
        }
        Ok(())
    }
}
