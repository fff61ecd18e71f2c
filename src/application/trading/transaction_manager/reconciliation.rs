use super::TransactionManager;
use crate::domain::events::RunEvent;
use crate::domain::trading::order::Order;
use crate::domain::trading::types::{BrokerEvent, BrokerOrder, FillEvent, OrderId, OrderStatus, SubmitOrderRequest};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Outcome of one reconciliation pass against the venue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Orders present locally and at the venue
    pub matched: Vec<OrderId>,
    /// Venue orders unknown locally, now tracked
    pub adopted: Vec<OrderId>,
    /// Local open orders settled from the venue's recent orders
    pub resolved: Vec<OrderId>,
    /// Local open orders the venue does not know
    pub missing: Vec<OrderId>,
    pub mismatches: Vec<OrderId>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatches.is_empty()
    }
}

impl TransactionManager {
    fn local_id_for(&self, broker_order: &BrokerOrder) -> Option<OrderId> {
        broker_order
            .order_id
            .filter(|id| self.orders.contains_key(id))
            .or_else(|| self.broker_index.get(&broker_order.broker_id).copied())
    }

    fn flag_mismatch(&mut self, id: OrderId, detail: String, report: &mut ReconciliationReport) {
        if let Some(order) = self.orders.get_mut(&id) {
            order.flags.reconciliation_mismatch = true;
        }
        warn!("TransactionManager: Reconciliation mismatch on {}: {}", id, detail);
        self.stats.reconciliation_mismatches += 1;
        self.run_events.push(RunEvent::ReconciliationMismatch { order_id: id, detail });
        if !report.mismatches.contains(&id) {
            report.mismatches.push(id);
        }
    }

    /// Brings local orders in line with the venue's view.
    ///
    /// `open` is the venue's open order set, `recent` its recently completed orders.
    /// The venue's filled quantity, status and quantity win; missing fills are applied
    /// as synthetic fills at the implied average price.
    pub fn reconcile(
        &mut self,
        open: &[BrokerOrder],
        recent: &[BrokerOrder],
        time: DateTime<Utc>,
    ) -> ReconciliationReport {
        let mut report = ReconciliationReport::default();
        let mut seen_open = BTreeSet::new();

        for broker_order in open {
            match self.local_id_for(broker_order) {
                Some(id) => {
                    seen_open.insert(id);
                    report.matched.push(id);
                    self.sync_with_venue(id, broker_order, time, &mut report);
                }
                None => {
                    let id = self.adopt(broker_order, time);
                    seen_open.insert(id);
                    report.adopted.push(id);
                }
            }
        }

        let local_open: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| o.is_open() && !seen_open.contains(&o.id))
            .map(|o| o.id)
            .collect();
        for id in local_open {
            let settled = recent
                .iter()
                .find(|bo| self.local_id_for(bo) == Some(id))
                .cloned();
            match settled {
                Some(broker_order) => {
                    self.sync_with_venue(id, &broker_order, time, &mut report);
                    report.resolved.push(id);
                }
                None => {
                    self.mark_missing(id, time, &mut report);
                    report.missing.push(id);
                }
            }
        }

        info!(
            "TransactionManager: Reconciled {} matched, {} adopted, {} resolved, {} missing, {} mismatched",
            report.matched.len(),
            report.adopted.len(),
            report.resolved.len(),
            report.missing.len(),
            report.mismatches.len()
        );
        report
    }

    fn sync_with_venue(
        &mut self,
        id: OrderId,
        venue: &BrokerOrder,
        time: DateTime<Utc>,
        report: &mut ReconciliationReport,
    ) {
        let Some(order) = self.orders.get(&id) else {
            return;
        };
        if order.status.is_terminal() {
            if venue.status != order.status {
                let detail = format!("local {} but venue reports {}", order.status, venue.status);
                self.flag_mismatch(id, detail, report);
            }
            return;
        }

        self.broker_index.insert(venue.broker_id.clone(), id);
        if let Some(order) = self.orders.get_mut(&id) {
            order.broker_id = Some(venue.broker_id.clone());
            order.flags.retryable_uncertain = false;
            if venue.quantity != order.quantity
                && !venue.quantity.is_zero()
                && venue.quantity.abs() >= order.filled_quantity.abs()
            {
                info!(
                    "TransactionManager: {} quantity {} -> {} from venue",
                    id, order.quantity, venue.quantity
                );
                order.quantity = venue.quantity;
            }
        }

        self.apply_fill_delta(id, venue, time, report);

        let Some(order) = self.orders.get(&id) else {
            return;
        };
        if order.status != venue.status && !order.status.is_terminal() {
            let mut status = order.status;
            if status == OrderStatus::New && venue.status != OrderStatus::New {
                status = OrderStatus::Submitted;
            }
            if status == venue.status || status.can_transition_to(venue.status) {
                if let Some(order) = self.orders.get_mut(&id) {
                    order.status = venue.status;
                    order.last_update = time;
                    if venue.status != OrderStatus::UpdateSubmitted {
                        order.pending_update = None;
                    }
                }
                self.push_order_event(id, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, time, "reconciled".to_string());
            } else {
                let detail = format!("cannot move from {} to venue status {}", order.status, venue.status);
                self.flag_mismatch(id, detail, report);
            }
        }
        self.refresh_reservation(id);
    }

    fn apply_fill_delta(
        &mut self,
        id: OrderId,
        venue: &BrokerOrder,
        time: DateTime<Utc>,
        report: &mut ReconciliationReport,
    ) {
        let Some(order) = self.orders.get(&id) else {
            return;
        };
        let delta = venue.filled_quantity - order.filled_quantity;
        if delta.is_zero() {
            return;
        }
        if delta.is_sign_negative() != order.quantity.is_sign_negative() {
            let detail = format!(
                "venue filled {} but {} applied locally",
                venue.filled_quantity, order.filled_quantity
            );
            self.flag_mismatch(id, detail, report);
            return;
        }

        let venue_notional = venue.filled_quantity * venue.average_fill_price;
        let local_notional = order.filled_quantity * order.average_fill_price;
        let implied = (venue_notional - local_notional) / delta;
        let price = if implied > Decimal::ZERO {
            implied
        } else {
            venue.average_fill_price
        };
        let fee = self
            .fee_model
            .as_ref()
            .map(|model| model.fee(delta.abs(), price))
            .unwrap_or(Decimal::ZERO);

        let fill = FillEvent {
            order_id: id,
            fill_id: format!("reconcile-{}-{}", id.0, venue.filled_quantity),
            quantity: delta,
            cumulative_quantity: venue.filled_quantity,
            price,
            fee,
            time,
        };
        if self.apply_broker_event(BrokerEvent::Filled(fill)).is_none() {
            self.flag_mismatch(id, format!("synthetic fill of {} rejected", delta), report);
        }
    }

    fn mark_missing(&mut self, id: OrderId, time: DateTime<Utc>, report: &mut ReconciliationReport) {
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        // PartiallyFilled has no edge to Invalid; what was filled stays filled
        let target = if order.status == OrderStatus::PartiallyFilled {
            OrderStatus::Canceled
        } else {
            OrderStatus::Invalid
        };
        if order.transition(target, time).is_ok() {
            order.reserved_margin = Decimal::ZERO;
            order.pending_update = None;
            self.push_order_event(id, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, time, "unknown at venue".to_string());
        }
        self.flag_mismatch(id, "order unknown at venue".to_string(), report);
    }

    fn adopt(&mut self, venue: &BrokerOrder, time: DateTime<Utc>) -> OrderId {
        let id = OrderId(self.next_id);
        self.next_id += 1;

        let request = SubmitOrderRequest {
            symbol: venue.symbol.clone(),
            quantity: venue.quantity,
            order_type: venue.order_type,
            limit_price: venue.limit_price,
            stop_price: venue.stop_price,
            tag: "adopted".to_string(),
        };
        let mut order = Order::new(id, request, time);
        order.status = venue.status;
        order.broker_id = Some(venue.broker_id.clone());
        order.filled_quantity = venue.filled_quantity;
        order.average_fill_price = venue.average_fill_price;
        order.flags.adopted = true;

        info!(
            "TransactionManager: Adopted venue order {} as {} ({} {} filled {})",
            venue.broker_id, id, venue.symbol, venue.quantity, venue.filled_quantity
        );
        self.broker_index.insert(venue.broker_id.clone(), id);
        self.orders.insert(id, order);
        self.refresh_reservation(id);
        id
    }
}

#[cfg(test)]
mod tests {
    use crate::application::trading::brokerage_gateway::SubmitOutcome;
    use crate::application::trading::transaction_manager::TransactionManager;
    use crate::domain::trading::types::{
        BrokerEvent, BrokerOrder, FillEvent, OrderId, OrderStatus, OrderType, SubmitOrderRequest,
    };
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn t() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap()
    }

    fn manager() -> TransactionManager {
        let mut tm = TransactionManager::new(dec!(100000));
        tm.set_universe(vec!["SPY".to_string(), "QQQ".to_string()]);
        tm
    }

    fn submit(tm: &mut TransactionManager, quantity: Decimal) -> OrderId {
        let id = tm.create_order(SubmitOrderRequest::limit("SPY", quantity, dec!(100)), t());
        tm.on_submit_outcome(id, &SubmitOutcome::Accepted, t());
        id
    }

    fn venue(id: Option<OrderId>, broker_id: &str, filled: Decimal, avg: Decimal, status: OrderStatus) -> BrokerOrder {
        BrokerOrder {
            order_id: id,
            broker_id: broker_id.to_string(),
            symbol: "SPY".to_string(),
            quantity: dec!(100),
            filled_quantity: filled,
            average_fill_price: avg,
            status,
            order_type: OrderType::Limit,
            limit_price: Some(dec!(100)),
            stop_price: None,
        }
    }

    #[test]
    fn test_venue_fills_win_for_open_orders() {
        let mut tm = manager();
        let id = submit(&mut tm, dec!(100));

        let report = tm.reconcile(
            &[venue(Some(id), "B-1", dec!(30), dec!(99), OrderStatus::PartiallyFilled)],
            &[],
            t(),
        );

        assert_eq!(report.matched, vec![id]);
        assert!(report.is_clean());
        let order = tm.order(id).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_quantity, dec!(30));
        assert_eq!(order.broker_id.as_deref(), Some("B-1"));
        assert_eq!(tm.portfolio().quantity("SPY"), dec!(30));
    }

    #[test]
    fn test_missing_orders_resolve_from_recent() {
        let mut tm = manager();
        let filled = submit(&mut tm, dec!(100));
        let gone = submit(&mut tm, dec!(100));

        let report = tm.reconcile(
            &[],
            &[venue(Some(filled), "B-1", dec!(100), dec!(101), OrderStatus::Filled)],
            t(),
        );

        assert_eq!(report.resolved, vec![filled]);
        assert_eq!(report.missing, vec![gone]);
        assert_eq!(tm.order(filled).unwrap().status, OrderStatus::Filled);
        assert_eq!(tm.order(filled).unwrap().average_fill_price, dec!(101));
        let lost = tm.order(gone).unwrap();
        assert_eq!(lost.status, OrderStatus::Invalid);
        assert!(lost.flags.reconciliation_mismatch);
        assert!(tm.open_orders().is_empty());
    }

    #[test]
    fn test_unknown_venue_orders_are_adopted_by_broker_id() {
        let mut tm = manager();
        let report = tm.reconcile(
            &[venue(None, "EXT-7", dec!(10), dec!(98), OrderStatus::PartiallyFilled)],
            &[],
            t(),
        );

        assert_eq!(report.adopted.len(), 1);
        let adopted = tm.order_by_broker_id("EXT-7").unwrap();
        assert!(adopted.flags.adopted);
        assert_eq!(adopted.filled_quantity, dec!(10));
        // Fills before adoption are not booked
        assert_eq!(tm.portfolio().quantity("SPY"), Decimal::ZERO);

        // A second pass matches instead of adopting again
        let again = tm.reconcile(
            &[venue(None, "EXT-7", dec!(10), dec!(98), OrderStatus::PartiallyFilled)],
            &[],
            t(),
        );
        assert!(again.adopted.is_empty());
        assert_eq!(again.matched.len(), 1);
    }

    fn venue_fill(id: OrderId, fill_id: &str, quantity: Decimal, cumulative_quantity: Decimal) -> BrokerEvent {
        BrokerEvent::Filled(FillEvent {
            order_id: id,
            fill_id: fill_id.to_string(),
            quantity,
            cumulative_quantity,
            price: dec!(100),
            fee: Decimal::ZERO,
            time: t(),
        })
    }

    #[test]
    fn test_reconciled_fill_is_not_double_counted() {
        let mut tm = manager();
        let id = submit(&mut tm, dec!(100));
        tm.reconcile(
            &[venue(Some(id), "B-1", dec!(40), dec!(100), OrderStatus::PartiallyFilled)],
            &[],
            t(),
        );

        // The venue's own fill event for the same 40 shares arrives afterwards
        assert!(tm.apply_broker_event(venue_fill(id, "V-1", dec!(40), dec!(40))).is_none());
        assert_eq!(tm.order(id).unwrap().filled_quantity, dec!(40));
        assert_eq!(tm.portfolio().quantity("SPY"), dec!(40));
        assert_eq!(tm.stats().dropped_broker_events, 0);
    }

    #[test]
    fn test_fill_after_reconciliation_completes_the_order() {
        let mut tm = manager();
        let id = submit(&mut tm, dec!(100));
        tm.reconcile(
            &[venue(Some(id), "B-1", dec!(40), dec!(100), OrderStatus::PartiallyFilled)],
            &[],
            t(),
        );

        let event = tm
            .apply_broker_event(venue_fill(id, "V-2", dec!(60), dec!(100)))
            .unwrap();
        assert_eq!(event.fill_quantity, dec!(60));
        let order = tm.order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_quantity, dec!(100));
        assert_eq!(tm.portfolio().quantity("SPY"), dec!(100));
        assert_eq!(tm.portfolio().cash, dec!(100000) - dec!(10000));
    }

    #[test]
    fn test_fill_straddling_reconciled_quantity_books_the_remainder() {
        let mut tm = manager();
        let id = submit(&mut tm, dec!(100));
        tm.reconcile(
            &[venue(Some(id), "B-1", dec!(40), dec!(100), OrderStatus::PartiallyFilled)],
            &[],
            t(),
        );

        // 30 of these 50 were already booked by reconciliation
        tm.apply_broker_event(venue_fill(id, "V-1", dec!(50), dec!(70)));
        assert_eq!(tm.order(id).unwrap().filled_quantity, dec!(70));
        assert_eq!(tm.portfolio().quantity("SPY"), dec!(70));
    }

    #[test]
    fn test_adopted_order_gone_from_venue_is_flagged() {
        let mut tm = manager();
        tm.reconcile(
            &[venue(None, "EXT-7", Decimal::ZERO, Decimal::ZERO, OrderStatus::Submitted)],
            &[],
            t(),
        );
        let id = tm.order_by_broker_id("EXT-7").unwrap().id;
        assert_eq!(tm.open_orders().len(), 1);

        let report = tm.reconcile(&[], &[], t());
        assert_eq!(report.missing, vec![id]);
        let order = tm.order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Invalid);
        assert!(order.flags.reconciliation_mismatch);
        assert!(tm.open_orders().is_empty());
    }

    #[test]
    fn test_adopted_order_resolves_from_recent_by_broker_id() {
        let mut tm = manager();
        tm.reconcile(
            &[venue(None, "EXT-7", Decimal::ZERO, Decimal::ZERO, OrderStatus::Submitted)],
            &[],
            t(),
        );
        let id = tm.order_by_broker_id("EXT-7").unwrap().id;

        let report = tm.reconcile(
            &[],
            &[venue(None, "EXT-7", Decimal::ZERO, Decimal::ZERO, OrderStatus::Canceled)],
            t(),
        );
        assert_eq!(report.resolved, vec![id]);
        assert!(report.is_clean());
        assert_eq!(tm.order(id).unwrap().status, OrderStatus::Canceled);
        assert!(tm.open_orders().is_empty());
    }

    #[test]
    fn test_partially_filled_missing_order_is_canceled() {
        let mut tm = manager();
        let id = submit(&mut tm, dec!(100));
        tm.reconcile(
            &[venue(Some(id), "B-1", dec!(40), dec!(100), OrderStatus::PartiallyFilled)],
            &[],
            t(),
        );

        let report = tm.reconcile(&[], &[], t());
        assert_eq!(report.missing, vec![id]);
        let order = tm.order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Canceled);
        assert!(order.flags.reconciliation_mismatch);
        assert_eq!(tm.portfolio().quantity("SPY"), dec!(40));
    }
}
