//! Order lifecycle and the only writer of the portfolio.
//!
//! Requests from the pipeline create orders here, broker events move them through
//! the state machine, and fills update cash and holdings atomically. Everything
//! observable (order events for hooks, run diagnostics) is collected in outboxes
//! the engine drains after each step.

mod reconciliation;

pub use reconciliation::ReconciliationReport;

use crate::application::trading::brokerage_gateway::SubmitOutcome;
use crate::domain::errors::{BrokerageError, TransactionError};
use crate::domain::events::RunEvent;
use crate::domain::market::slice::Slice;
use crate::domain::trading::fee_model::FeeModel;
use crate::domain::trading::order::Order;
use crate::domain::trading::portfolio::Portfolio;
use crate::domain::trading::types::{
    BrokerEvent, FillEvent, OrderEvent, OrderId, OrderStatus, OrderType, RejectReason,
    SubmitOrderRequest, UpdateOrderFields,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub orders_submitted: u64,
    pub orders_rejected: u64,
    pub fills: u64,
    pub dropped_broker_events: u64,
    pub reconciliation_mismatches: u64,
}

/// What the caller must do after a cancel or update request was accepted locally.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerAction {
    /// Resolved without the venue (order never left the engine)
    None,
    /// Forward to the brokerage with this order snapshot
    Forward(Order),
}

pub struct TransactionManager {
    portfolio: Portfolio,
    orders: BTreeMap<OrderId, Order>,
    broker_index: HashMap<String, OrderId>,
    applied_fills: HashSet<String>,
    next_id: u64,
    universe: BTreeSet<String>,
    prices: HashMap<String, Decimal>,
    fee_model: Option<Arc<dyn FeeModel>>,
    margin_check: bool,
    run_events: Vec<RunEvent>,
    order_events: Vec<OrderEvent>,
    stats: TransactionStats,
}

impl TransactionManager {
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            portfolio: Portfolio::new(initial_cash),
            orders: BTreeMap::new(),
            broker_index: HashMap::new(),
            applied_fills: HashSet::new(),
            next_id: 1,
            universe: BTreeSet::new(),
            prices: HashMap::new(),
            fee_model: None,
            margin_check: true,
            run_events: Vec::new(),
            order_events: Vec::new(),
            stats: TransactionStats::default(),
        }
    }

    /// Used to estimate fees for margin checks.
    pub fn with_fee_model(mut self, fee_model: Arc<dyn FeeModel>) -> Self {
        self.fee_model = Some(fee_model);
        self
    }

    pub fn with_margin_check(mut self, enabled: bool) -> Self {
        self.margin_check = enabled;
        self
    }

    pub fn set_universe(&mut self, symbols: impl IntoIterator<Item = String>) {
        self.universe = symbols.into_iter().collect();
    }

    pub fn universe(&self) -> &BTreeSet<String> {
        &self.universe
    }

    /// Records the latest price of every symbol in the slice.
    pub fn update_prices(&mut self, slice: &Slice) {
        for symbol in slice.symbols() {
            if let Some(price) = slice.price(symbol) {
                self.prices.insert(symbol.to_string(), price);
            }
        }
    }

    pub fn prices(&self) -> &HashMap<String, Decimal> {
        &self.prices
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn equity(&self) -> Decimal {
        self.portfolio.total_equity(&self.prices)
    }

    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    pub fn open_orders(&self) -> Vec<&Order> {
        self.orders.values().filter(|o| o.is_open()).collect()
    }

    pub fn order_by_broker_id(&self, broker_id: &str) -> Option<&Order> {
        self.broker_index
            .get(broker_id)
            .and_then(|id| self.orders.get(id))
    }

    pub fn reserved_margin(&self) -> Decimal {
        self.orders
            .values()
            .filter(|o| o.is_open())
            .map(|o| o.reserved_margin)
            .sum()
    }

    pub fn stats(&self) -> TransactionStats {
        self.stats
    }

    pub fn take_run_events(&mut self) -> Vec<RunEvent> {
        std::mem::take(&mut self.run_events)
    }

    pub fn take_order_events(&mut self) -> Vec<OrderEvent> {
        std::mem::take(&mut self.order_events)
    }

    // ===== Margin =====

    fn reference_price(&self, order: &Order) -> Option<Decimal> {
        order
            .limit_price
            .or_else(|| self.prices.get(&order.symbol).copied())
            .or(order.stop_price)
    }

    /// Buying power needed for the exposure-increasing part of the unfilled quantity.
    fn required_margin(&self, order: &Order) -> Decimal {
        let remaining = order.remaining_quantity();
        if remaining.is_zero() {
            return Decimal::ZERO;
        }
        let held = self.portfolio.quantity(&order.symbol);
        let increasing = if held.is_zero() || held.is_sign_negative() == remaining.is_sign_negative() {
            remaining.abs()
        } else {
            (remaining.abs() - held.abs()).max(Decimal::ZERO)
        };
        if increasing.is_zero() {
            return Decimal::ZERO;
        }
        let Some(price) = self.reference_price(order) else {
            debug!(
                "TransactionManager: no reference price for {}, margin not reserved",
                order.symbol
            );
            return Decimal::ZERO;
        };
        let fee = self
            .fee_model
            .as_ref()
            .map(|model| model.fee(increasing, price))
            .unwrap_or(Decimal::ZERO);
        increasing * price + fee
    }

    fn refresh_reservation(&mut self, id: OrderId) {
        let Some(order) = self.orders.get(&id) else {
            return;
        };
        let reserved = if order.is_open() {
            self.required_margin(order)
        } else {
            Decimal::ZERO
        };
        if let Some(order) = self.orders.get_mut(&id) {
            order.reserved_margin = reserved;
        }
    }

    fn check_margin_violation(&mut self) {
        if !self.margin_check {
            return;
        }
        let reserved = self.reserved_margin();
        if self.portfolio.cash - reserved < Decimal::ZERO {
            warn!(
                "TransactionManager: margin violated, cash {} reserved {}",
                self.portfolio.cash, reserved
            );
            self.run_events.push(RunEvent::MarginViolation {
                cash: self.portfolio.cash,
                reserved,
            });
        }
    }

    // ===== Requests from the pipeline =====

    fn validate_request(&self, order: &Order) -> Result<(), (RejectReason, String)> {
        if order.quantity.is_zero() {
            return Err((RejectReason::InvalidOrder, "quantity is zero".to_string()));
        }
        if !self.universe.contains(&order.symbol) {
            return Err((
                RejectReason::InvalidSymbol,
                format!("{} is not in the universe", order.symbol),
            ));
        }
        let needs_limit = matches!(order.order_type, OrderType::Limit | OrderType::StopLimit);
        let needs_stop = matches!(order.order_type, OrderType::StopMarket | OrderType::StopLimit);
        if needs_limit && order.limit_price.is_none() {
            return Err((RejectReason::InvalidOrder, "limit price missing".to_string()));
        }
        if needs_stop && order.stop_price.is_none() {
            return Err((RejectReason::InvalidOrder, "stop price missing".to_string()));
        }
        if order.limit_price.is_some_and(|p| p <= Decimal::ZERO) {
            return Err((RejectReason::InvalidOrder, "limit price must be positive".to_string()));
        }
        if order.stop_price.is_some_and(|p| p <= Decimal::ZERO) {
            return Err((RejectReason::InvalidOrder, "stop price must be positive".to_string()));
        }
        if self.margin_check {
            let required = self.required_margin(order);
            let available = self.portfolio.cash - self.reserved_margin();
            if available - required < Decimal::ZERO {
                return Err((
                    RejectReason::InsufficientMargin,
                    format!("required {} exceeds available {}", required, available),
                ));
            }
        }
        Ok(())
    }

    /// Registers a new order. Orders failing local validation end Invalid immediately.
    pub fn create_order(&mut self, request: SubmitOrderRequest, time: DateTime<Utc>) -> OrderId {
        let id = OrderId(self.next_id);
        self.next_id += 1;
        let mut order = Order::new(id, request, time);

        match self.validate_request(&order) {
            Ok(()) => {
                order.reserved_margin = self.required_margin(&order);
                info!(
                    "TransactionManager: Created order {} {} {} {} @ {:?}",
                    id,
                    order.side(),
                    order.quantity.abs(),
                    order.symbol,
                    order.limit_price
                );
                self.stats.orders_submitted += 1;
                self.orders.insert(id, order);
            }
            Err((reason, message)) => {
                order.status = OrderStatus::Invalid;
                order.rejection = Some((reason, message.clone()));
                self.orders.insert(id, order);
                self.reject_event(id, reason, message, time);
            }
        }
        id
    }

    fn reject_event(&mut self, id: OrderId, reason: RejectReason, message: String, time: DateTime<Utc>) {
        let Some(order) = self.orders.get(&id) else {
            return;
        };
        warn!(
            "TransactionManager: Order {} {} rejected: {} ({})",
            id, order.symbol, reason, message
        );
        self.stats.orders_rejected += 1;
        self.run_events.push(RunEvent::OrderRejected {
            order_id: id,
            symbol: order.symbol.clone(),
            reason,
            message: message.clone(),
        });
        self.push_order_event(id, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, time, message);
    }

    fn push_order_event(
        &mut self,
        id: OrderId,
        fill_quantity: Decimal,
        fill_price: Decimal,
        fee: Decimal,
        time: DateTime<Utc>,
        message: String,
    ) -> Option<OrderEvent> {
        let order = self.orders.get(&id)?;
        let event = OrderEvent {
            order_id: id,
            symbol: order.symbol.clone(),
            status: order.status,
            fill_quantity,
            fill_price,
            fee,
            time,
            message,
        };
        self.order_events.push(event.clone());
        Some(event)
    }

    /// Records the result of handing a new order to the brokerage.
    pub fn on_submit_outcome(&mut self, id: OrderId, outcome: &SubmitOutcome, time: DateTime<Utc>) {
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        if order.status != OrderStatus::New {
            // A broker event already moved the order on
            return;
        }
        match outcome {
            SubmitOutcome::Accepted => {
                if order.transition(OrderStatus::Submitted, time).is_ok() {
                    self.push_order_event(id, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, time, String::new());
                }
            }
            SubmitOutcome::Rejected { reason, message } => {
                if order.transition(OrderStatus::Invalid, time).is_ok() {
                    order.rejection = Some((*reason, message.clone()));
                    order.reserved_margin = Decimal::ZERO;
                    self.reject_event(id, *reason, message.clone(), time);
                }
            }
            SubmitOutcome::Uncertain(error) => {
                order.flags.retryable_uncertain = true;
                warn!(
                    "TransactionManager: Submission of {} uncertain: {}",
                    id, error
                );
                self.run_events.push(RunEvent::SubmissionUncertain {
                    order_id: id,
                    detail: error.to_string(),
                });
            }
        }
    }

    pub fn request_cancel(&mut self, id: OrderId, time: DateTime<Utc>) -> Result<BrokerAction, TransactionError> {
        let order = self
            .orders
            .get_mut(&id)
            .ok_or(TransactionError::UnknownOrder(id))?;
        if order.status.is_terminal() {
            return Err(TransactionError::TerminalOrder {
                order_id: id,
                status: order.status,
            });
        }
        if order.status == OrderStatus::New && !order.flags.retryable_uncertain {
            order.transition(OrderStatus::Canceled, time)?;
            order.reserved_margin = Decimal::ZERO;
            info!("TransactionManager: Canceled {} before submission", id);
            self.push_order_event(id, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, time, "canceled locally".to_string());
            return Ok(BrokerAction::None);
        }
        order.flags.cancel_requested = true;
        Ok(BrokerAction::Forward(order.clone()))
    }

    pub fn on_cancel_failed(&mut self, id: OrderId, error: &BrokerageError) {
        if let Some(order) = self.orders.get_mut(&id) {
            order.flags.cancel_requested = false;
            warn!("TransactionManager: Cancel of {} failed: {}", id, error);
        }
    }

    fn validate_update(order: &Order, fields: &UpdateOrderFields) -> Result<(), String> {
        if let Some(quantity) = fields.quantity {
            if quantity.is_zero() || quantity.is_sign_negative() != order.quantity.is_sign_negative() {
                return Err("updated quantity must be non-zero with the same sign".to_string());
            }
            if quantity.abs() < order.filled_quantity.abs() {
                return Err("updated quantity is below the filled quantity".to_string());
            }
        }
        if fields.limit_price.is_some_and(|p| p <= Decimal::ZERO)
            || fields.stop_price.is_some_and(|p| p <= Decimal::ZERO)
        {
            return Err("updated prices must be positive".to_string());
        }
        if fields.limit_price.is_some() && order.limit_price.is_none() {
            return Err(format!("{} order has no limit price", order.order_type));
        }
        if fields.stop_price.is_some() && order.stop_price.is_none() {
            return Err(format!("{} order has no stop price", order.order_type));
        }
        Ok(())
    }

    fn apply_update_fields(order: &mut Order, fields: &UpdateOrderFields) {
        if let Some(quantity) = fields.quantity {
            order.quantity = quantity;
        }
        if let Some(limit) = fields.limit_price {
            order.limit_price = Some(limit);
        }
        if let Some(stop) = fields.stop_price {
            order.stop_price = Some(stop);
        }
        if let Some(tag) = &fields.tag {
            order.tag = tag.clone();
        }
    }

    pub fn request_update(
        &mut self,
        id: OrderId,
        fields: UpdateOrderFields,
        time: DateTime<Utc>,
    ) -> Result<BrokerAction, TransactionError> {
        let order = self
            .orders
            .get(&id)
            .ok_or(TransactionError::UnknownOrder(id))?;
        if order.status.is_terminal() {
            return Err(TransactionError::TerminalOrder {
                order_id: id,
                status: order.status,
            });
        }
        if order.status == OrderStatus::UpdateSubmitted {
            return Err(TransactionError::InvalidRequest {
                order_id: id,
                reason: "an update is already pending".to_string(),
            });
        }
        Self::validate_update(order, &fields)
            .map_err(|reason| TransactionError::InvalidRequest { order_id: id, reason })?;

        if self.margin_check {
            let mut candidate = order.clone();
            Self::apply_update_fields(&mut candidate, &fields);
            let required = self.required_margin(&candidate);
            let available = self.portfolio.cash - (self.reserved_margin() - order.reserved_margin);
            if available - required < Decimal::ZERO {
                return Err(TransactionError::InvalidRequest {
                    order_id: id,
                    reason: format!("update requires {} margin, {} available", required, available),
                });
            }
        }

        let local_only = order.status == OrderStatus::New && !order.flags.retryable_uncertain;
        let Some(order) = self.orders.get_mut(&id) else {
            return Err(TransactionError::UnknownOrder(id));
        };
        if local_only {
            Self::apply_update_fields(order, &fields);
            order.last_update = time;
            self.refresh_reservation(id);
            return Ok(BrokerAction::None);
        }
        order.transition(OrderStatus::UpdateSubmitted, time)?;
        order.pending_update = Some(fields);
        let snapshot = order.clone();
        self.push_order_event(id, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, time, String::new());
        Ok(BrokerAction::Forward(snapshot))
    }

    pub fn on_update_failed(&mut self, id: OrderId, error: &BrokerageError, time: DateTime<Utc>) {
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        if order.status != OrderStatus::UpdateSubmitted {
            return;
        }
        if error.is_definitive() {
            order.pending_update = None;
            let working = order.working_status();
            if order.transition(working, time).is_ok() {
                self.push_order_event(id, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, time, error.to_string());
            }
        } else {
            order.flags.retryable_uncertain = true;
            self.run_events.push(RunEvent::SubmissionUncertain {
                order_id: id,
                detail: error.to_string(),
            });
        }
        warn!("TransactionManager: Update of {} failed: {}", id, error);
    }

    // ===== Broker events =====

    fn drop_event(&mut self, id: OrderId, reason: String) -> Option<OrderEvent> {
        warn!("TransactionManager: Dropping broker event for {}: {}", id, reason);
        self.stats.dropped_broker_events += 1;
        self.run_events.push(RunEvent::DroppedBrokerEvent {
            order_id: id,
            reason,
        });
        None
    }

    /// Treats the first venue event on a New order as its acknowledgment.
    fn implicit_ack(order: &mut Order, time: DateTime<Utc>) {
        if order.status == OrderStatus::New && order.transition(OrderStatus::Submitted, time).is_ok() {
            order.flags.retryable_uncertain = false;
        }
    }

    /// Applies one venue event. Returns the resulting order event, if the order changed.
    ///
    /// Events for unknown or terminal orders, duplicates and malformed fills are dropped
    /// with a warning and a `DroppedBrokerEvent` diagnostic.
    pub fn apply_broker_event(&mut self, event: BrokerEvent) -> Option<OrderEvent> {
        let id = event.order_id();
        let Some(order) = self.orders.get(&id) else {
            return self.drop_event(id, "unknown order".to_string());
        };
        if order.status.is_terminal() {
            let reason = format!("order is already {}", order.status);
            return self.drop_event(id, reason);
        }

        match event {
            BrokerEvent::Filled(fill) => self.apply_fill(fill),
            BrokerEvent::Acknowledged {
                broker_id, time, ..
            } => {
                let order = self.orders.get_mut(&id)?;
                let was_new = order.status == OrderStatus::New;
                Self::implicit_ack(order, time);
                order.broker_id = Some(broker_id.clone());
                self.broker_index.insert(broker_id, id);
                if was_new {
                    self.push_order_event(id, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, time, String::new())
                } else {
                    None
                }
            }
            BrokerEvent::Rejected {
                reason,
                message,
                time,
                ..
            } => {
                let order = self.orders.get_mut(&id)?;
                Self::implicit_ack(order, time);
                if let Err(e) = order.transition(OrderStatus::Invalid, time) {
                    return self.drop_event(id, e.to_string());
                }
                order.rejection = Some((reason, message.clone()));
                order.reserved_margin = Decimal::ZERO;
                self.reject_event(id, reason, message, time);
                self.order_events.last().cloned()
            }
            BrokerEvent::Canceled { time, .. } => {
                let order = self.orders.get_mut(&id)?;
                Self::implicit_ack(order, time);
                if let Err(e) = order.transition(OrderStatus::Canceled, time) {
                    return self.drop_event(id, e.to_string());
                }
                order.reserved_margin = Decimal::ZERO;
                order.pending_update = None;
                info!("TransactionManager: Order {} canceled", id);
                self.push_order_event(id, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, time, String::new())
            }
            BrokerEvent::UpdateAcknowledged { time, .. } => {
                let order = self.orders.get_mut(&id)?;
                let Some(fields) = order.pending_update.take() else {
                    return self.drop_event(id, "no update pending".to_string());
                };
                Self::apply_update_fields(order, &fields);
                let working = order.working_status();
                if let Err(e) = order.transition(working, time) {
                    return self.drop_event(id, e.to_string());
                }
                self.refresh_reservation(id);
                self.push_order_event(id, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, time, "update applied".to_string())
            }
            BrokerEvent::UpdateRejected { message, time, .. } => {
                let order = self.orders.get_mut(&id)?;
                if order.pending_update.take().is_none() {
                    return self.drop_event(id, "no update pending".to_string());
                }
                let working = order.working_status();
                if let Err(e) = order.transition(working, time) {
                    return self.drop_event(id, e.to_string());
                }
                warn!("TransactionManager: Update of {} rejected: {}", id, message);
                self.push_order_event(id, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, time, message)
            }
        }
    }

    fn apply_fill(&mut self, fill: FillEvent) -> Option<OrderEvent> {
        let id = fill.order_id;
        if self.applied_fills.contains(&fill.fill_id) {
            return self.drop_event(id, format!("duplicate fill {}", fill.fill_id));
        }
        let order = self.orders.get(&id)?;

        if fill.quantity.is_zero() || fill.quantity.is_sign_negative() != order.quantity.is_sign_negative() {
            return self.drop_event(id, format!("fill quantity {} has the wrong sign", fill.quantity));
        }
        if fill.price <= Decimal::ZERO || fill.fee < Decimal::ZERO {
            return self.drop_event(id, format!("fill price {} / fee {} invalid", fill.price, fill.fee));
        }

        let cumulative = fill.cumulative_quantity;
        if cumulative.is_sign_negative() != order.quantity.is_sign_negative()
            || cumulative.abs() < fill.quantity.abs()
        {
            return self.drop_event(
                id,
                format!("cumulative {} inconsistent with fill {}", cumulative, fill.quantity),
            );
        }
        // The venue's running total bounds what this fill can still add
        let outstanding = cumulative - order.filled_quantity;
        if outstanding.is_zero() || outstanding.is_sign_negative() != order.quantity.is_sign_negative() {
            self.applied_fills.insert(fill.fill_id.clone());
            debug!(
                "TransactionManager: Fill {} for {} already reflected ({} of {} filled)",
                fill.fill_id, id, order.filled_quantity, cumulative
            );
            return None;
        }
        let quantity = if outstanding.abs() < fill.quantity.abs() {
            outstanding
        } else {
            fill.quantity
        };

        let new_filled = order.filled_quantity + quantity;
        if new_filled.abs() > order.quantity.abs() {
            return self.drop_event(
                id,
                format!(
                    "overfill: {} + {} exceeds {}",
                    order.filled_quantity, quantity, order.quantity
                ),
            );
        }
        let next_status = if new_filled == order.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let acked_status = if order.status == OrderStatus::New {
            OrderStatus::Submitted
        } else {
            order.status
        };
        if !acked_status.can_transition_to(next_status) {
            return self.drop_event(id, format!("cannot move from {} to {}", acked_status, next_status));
        }

        // Compute everything first, then commit in one step
        let average = (order.filled_quantity * order.average_fill_price + quantity * fill.price) / new_filled;
        let impact = self
            .portfolio
            .preview_fill(&order.symbol, quantity, fill.price, fill.fee);

        let order = self.orders.get_mut(&id)?;
        Self::implicit_ack(order, fill.time);
        order.filled_quantity = new_filled;
        order.average_fill_price = average;
        order.total_fees += fill.fee;
        order.status = next_status;
        order.last_update = fill.time;
        if next_status == OrderStatus::Filled {
            order.pending_update = None;
        }
        self.portfolio.commit(impact);
        self.applied_fills.insert(fill.fill_id.clone());
        self.stats.fills += 1;
        self.refresh_reservation(id);

        info!(
            "TransactionManager: Fill {} on {}: {} @ {} (fee {}), {}",
            fill.fill_id, id, quantity, fill.price, fill.fee, next_status
        );
        self.check_margin_violation();
        self.push_order_event(id, quantity, fill.price, fill.fee, fill.time, String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::fee_model::ConstantFeeModel;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap()
    }

    fn manager(cash: Decimal) -> TransactionManager {
        let mut tm = TransactionManager::new(cash);
        tm.set_universe(vec!["SPY".to_string(), "QQQ".to_string()]);
        tm
    }

    fn submitted(tm: &mut TransactionManager, request: SubmitOrderRequest) -> OrderId {
        let id = tm.create_order(request, t());
        tm.on_submit_outcome(id, &SubmitOutcome::Accepted, t());
        id
    }

    fn fill(id: OrderId, fill_id: &str, quantity: Decimal, price: Decimal, fee: Decimal) -> BrokerEvent {
        cumulative_fill(id, fill_id, quantity, quantity, price, fee)
    }

    fn cumulative_fill(
        id: OrderId,
        fill_id: &str,
        quantity: Decimal,
        cumulative_quantity: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> BrokerEvent {
        BrokerEvent::Filled(FillEvent {
            order_id: id,
            fill_id: fill_id.to_string(),
            quantity,
            cumulative_quantity,
            price,
            fee,
            time: t(),
        })
    }

    #[test]
    fn test_partial_fills_accumulate_vwap() {
        let mut tm = manager(dec!(10000));
        let id = submitted(&mut tm, SubmitOrderRequest::limit("SPY", dec!(100), dec!(11)));

        let first = tm.apply_broker_event(fill(id, "f1", dec!(40), dec!(10.00), dec!(1))).unwrap();
        assert_eq!(first.status, OrderStatus::PartiallyFilled);
        tm.apply_broker_event(cumulative_fill(id, "f2", dec!(60), dec!(100), dec!(10.50), dec!(1)));

        let order = tm.order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_quantity, dec!(100));
        assert_eq!(order.average_fill_price, dec!(10.30));
        assert_eq!(order.reserved_margin, Decimal::ZERO);
        assert_eq!(tm.portfolio().cash, dec!(10000) - dec!(1030) - dec!(2));
        assert_eq!(tm.portfolio().quantity("SPY"), dec!(100));
    }

    #[test]
    fn test_duplicate_fill_applied_once() {
        let mut tm = manager(dec!(10000));
        let id = submitted(&mut tm, SubmitOrderRequest::limit("SPY", dec!(100), dec!(11)));

        tm.apply_broker_event(fill(id, "f1", dec!(40), dec!(10), Decimal::ZERO));
        let cash = tm.portfolio().cash;
        assert!(tm.apply_broker_event(fill(id, "f1", dec!(40), dec!(10), Decimal::ZERO)).is_none());

        assert_eq!(tm.portfolio().cash, cash);
        assert_eq!(tm.order(id).unwrap().filled_quantity, dec!(40));
        assert_eq!(tm.stats().dropped_broker_events, 1);
    }

    #[test]
    fn test_events_on_terminal_orders_are_dropped() {
        let mut tm = manager(dec!(10000));
        let id = submitted(&mut tm, SubmitOrderRequest::limit("SPY", dec!(10), dec!(11)));
        tm.apply_broker_event(BrokerEvent::Canceled { order_id: id, time: t() });

        assert!(tm.apply_broker_event(fill(id, "late", dec!(10), dec!(10), Decimal::ZERO)).is_none());
        assert_eq!(tm.order(id).unwrap().status, OrderStatus::Canceled);
        assert_eq!(tm.portfolio().quantity("SPY"), Decimal::ZERO);
        let events = tm.take_run_events();
        assert!(matches!(events.last(), Some(RunEvent::DroppedBrokerEvent { .. })));
    }

    #[test]
    fn test_malformed_fills_are_dropped() {
        let mut tm = manager(dec!(10000));
        let id = submitted(&mut tm, SubmitOrderRequest::limit("SPY", dec!(10), dec!(11)));

        assert!(tm.apply_broker_event(fill(id, "neg", dec!(-5), dec!(10), Decimal::ZERO)).is_none());
        assert!(tm.apply_broker_event(fill(id, "zero-price", dec!(5), dec!(0), Decimal::ZERO)).is_none());
        assert!(tm.apply_broker_event(fill(id, "over", dec!(11), dec!(10), Decimal::ZERO)).is_none());
        assert!(tm.apply_broker_event(fill(OrderId(99), "ghost", dec!(1), dec!(10), Decimal::ZERO)).is_none());
        assert_eq!(tm.stats().dropped_broker_events, 4);
        assert_eq!(tm.order(id).unwrap().status, OrderStatus::Submitted);
    }

    #[test]
    fn test_local_rejections() {
        let mut tm = manager(dec!(1000));

        let zero = tm.create_order(SubmitOrderRequest::market("SPY", Decimal::ZERO), t());
        let unknown = tm.create_order(SubmitOrderRequest::market("TSLA", dec!(1)), t());
        let bad_limit = tm.create_order(SubmitOrderRequest::limit("SPY", dec!(1), dec!(-1)), t());
        let too_big = tm.create_order(SubmitOrderRequest::limit("SPY", dec!(200), dec!(10)), t());

        let reason = |id: OrderId| tm.order(id).unwrap().rejection.as_ref().map(|(r, _)| *r);
        assert_eq!(reason(zero), Some(RejectReason::InvalidOrder));
        assert_eq!(reason(unknown), Some(RejectReason::InvalidSymbol));
        assert_eq!(reason(bad_limit), Some(RejectReason::InvalidOrder));
        assert_eq!(reason(too_big), Some(RejectReason::InsufficientMargin));
        assert!(tm.orders().all(|o| o.status == OrderStatus::Invalid));
        assert_eq!(tm.take_run_events().len(), 4);
        assert_eq!(tm.take_order_events().len(), 4);
    }

    #[test]
    fn test_margin_accounts_for_open_orders_and_fees() {
        let fees = Arc::new(ConstantFeeModel::new(dec!(0.01), dec!(1)));
        let mut tm = manager(dec!(1000)).with_fee_model(fees);

        let first = submitted(&mut tm, SubmitOrderRequest::limit("SPY", dec!(50), dec!(10)));
        assert_eq!(tm.order(first).unwrap().reserved_margin, dec!(501));
        let second = tm.create_order(SubmitOrderRequest::limit("QQQ", dec!(50), dec!(10)), t());
        assert_eq!(tm.order(second).unwrap().status, OrderStatus::Invalid);

        // Closing exposure needs no margin
        tm.apply_broker_event(fill(first, "f1", dec!(50), dec!(10), dec!(1)));
        let close = tm.create_order(SubmitOrderRequest::limit("SPY", dec!(-50), dec!(10)), t());
        assert_eq!(tm.order(close).unwrap().status, OrderStatus::New);
        assert_eq!(tm.order(close).unwrap().reserved_margin, Decimal::ZERO);
    }

    #[test]
    fn test_event_on_new_order_is_implicit_ack() {
        let mut tm = manager(dec!(10000));
        let id = tm.create_order(SubmitOrderRequest::limit("SPY", dec!(10), dec!(11)), t());
        let timeout = BrokerageError::Timeout {
            operation: "submit".to_string(),
            timeout_ms: 100,
        };
        tm.on_submit_outcome(id, &SubmitOutcome::Uncertain(timeout), t());
        assert!(tm.order(id).unwrap().flags.retryable_uncertain);

        tm.apply_broker_event(fill(id, "f1", dec!(10), dec!(10), Decimal::ZERO));
        let order = tm.order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(!order.flags.retryable_uncertain);
    }

    #[test]
    fn test_update_round_trip() {
        let mut tm = manager(dec!(10000));
        let id = submitted(&mut tm, SubmitOrderRequest::limit("SPY", dec!(10), dec!(11)));

        let fields = UpdateOrderFields {
            limit_price: Some(dec!(10.5)),
            ..Default::default()
        };
        assert!(matches!(
            tm.request_update(id, fields.clone(), t()).unwrap(),
            BrokerAction::Forward(_)
        ));
        assert_eq!(tm.order(id).unwrap().status, OrderStatus::UpdateSubmitted);
        assert!(tm.request_update(id, fields, t()).is_err());

        tm.apply_broker_event(BrokerEvent::UpdateAcknowledged { order_id: id, time: t() });
        let order = tm.order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Submitted);
        assert_eq!(order.limit_price, Some(dec!(10.5)));
        assert_eq!(order.reserved_margin, dec!(105));
    }

    #[test]
    fn test_cancel_before_submission_is_local() {
        let mut tm = manager(dec!(10000));
        let id = tm.create_order(SubmitOrderRequest::limit("SPY", dec!(10), dec!(11)), t());
        assert_eq!(tm.request_cancel(id, t()).unwrap(), BrokerAction::None);
        assert_eq!(tm.order(id).unwrap().status, OrderStatus::Canceled);
        assert!(matches!(
            tm.request_cancel(id, t()),
            Err(TransactionError::TerminalOrder { .. })
        ));
    }
}
