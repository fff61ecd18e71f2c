//! Prometheus metrics for the engine.
//!
//! All metrics use the `synctrade_` prefix. Nothing is served over HTTP; callers render
//! the registry and ship the text wherever they like.

use crate::domain::events::{RunEvent, RunEventListener};
use crate::domain::market::slice::Slice;
use crate::domain::trading::types::OrderStatus;
use prometheus::{Counter, CounterVec, Gauge, Opts, Registry, TextEncoder};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;

#[derive(Clone)]
pub struct EngineMetrics {
    registry: Arc<Registry>,
    pub slices_total: Counter,
    pub data_points_total: Counter,
    pub fill_forward_points_total: Counter,
    pub out_of_order_points_total: Counter,
    /// Subscriptions currently stale
    pub stale_subscriptions: Gauge,
    /// Order status changes, labelled by the status reached
    pub orders_total: CounterVec,
    pub fills_total: Counter,
    pub dropped_broker_events_total: Counter,
    pub reconciliation_mismatches_total: Counter,
    pub synchronization_stalls_total: Counter,
    pub portfolio_cash: Gauge,
    pub portfolio_equity: Gauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> anyhow::Result<Counter> {
    let counter = Counter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> anyhow::Result<Gauge> {
    let gauge = Gauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl EngineMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let orders_total = CounterVec::new(
            Opts::new("synctrade_orders_total", "Order status changes by status"),
            &["status"],
        )?;
        registry.register(Box::new(orders_total.clone()))?;

        Ok(Self {
            slices_total: counter(&registry, "synctrade_slices_total", "Slices emitted")?,
            data_points_total: counter(
                &registry,
                "synctrade_data_points_total",
                "Real data points delivered",
            )?,
            fill_forward_points_total: counter(
                &registry,
                "synctrade_fill_forward_points_total",
                "Fill-forward points delivered",
            )?,
            out_of_order_points_total: counter(
                &registry,
                "synctrade_out_of_order_points_total",
                "Late points delivered after their frontier",
            )?,
            stale_subscriptions: gauge(
                &registry,
                "synctrade_stale_subscriptions",
                "Subscriptions currently stale",
            )?,
            orders_total,
            fills_total: counter(&registry, "synctrade_fills_total", "Fills applied")?,
            dropped_broker_events_total: counter(
                &registry,
                "synctrade_dropped_broker_events_total",
                "Broker events dropped as duplicate or malformed",
            )?,
            reconciliation_mismatches_total: counter(
                &registry,
                "synctrade_reconciliation_mismatches_total",
                "Orders flagged during reconciliation",
            )?,
            synchronization_stalls_total: counter(
                &registry,
                "synctrade_synchronization_stalls_total",
                "Live synchronizer stalls",
            )?,
            portfolio_cash: gauge(&registry, "synctrade_portfolio_cash", "Portfolio cash")?,
            portfolio_equity: gauge(&registry, "synctrade_portfolio_equity", "Portfolio equity")?,
            registry: Arc::new(registry),
        })
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }

    pub fn record_slice(&self, slice: &Slice) {
        self.slices_total.inc();
        for point in slice.points() {
            if point.is_fill_forward {
                self.fill_forward_points_total.inc();
            } else {
                self.data_points_total.inc();
            }
            if point.is_out_of_order {
                self.out_of_order_points_total.inc();
            }
        }
    }

    pub fn record_order_status(&self, status: OrderStatus, is_fill: bool) {
        self.orders_total
            .with_label_values(&[&status.to_string()])
            .inc();
        if is_fill {
            self.fills_total.inc();
        }
    }

    pub fn set_portfolio(&self, cash: Decimal, equity: Decimal) {
        self.portfolio_cash.set(cash.to_f64().unwrap_or(0.0));
        self.portfolio_equity.set(equity.to_f64().unwrap_or(0.0));
    }
}

/// Feeds run diagnostics from the event bus into the metrics.
impl RunEventListener for EngineMetrics {
    fn on_event(&self, event: &RunEvent) {
        match event {
            RunEvent::SubscriptionStale { .. } => self.stale_subscriptions.inc(),
            RunEvent::SubscriptionResumed { .. } => self.stale_subscriptions.dec(),
            RunEvent::DroppedBrokerEvent { .. } => self.dropped_broker_events_total.inc(),
            RunEvent::ReconciliationMismatch { .. } => self.reconciliation_mismatches_total.inc(),
            RunEvent::SynchronizationStall { .. } => self.synchronization_stalls_total.inc(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::data_point::SubscriptionId;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_metrics_creation() {
        let metrics = EngineMetrics::new().expect("Failed to create metrics");
        metrics.set_portfolio(dec!(1000.5), dec!(1200));
        assert_eq!(metrics.portfolio_cash.get(), 1000.5);

        let output = metrics.render();
        assert!(output.contains("synctrade_portfolio_equity"));
    }

    #[test]
    fn test_order_counter_by_status() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.record_order_status(OrderStatus::Filled, true);
        metrics.record_order_status(OrderStatus::Filled, false);
        metrics.record_order_status(OrderStatus::Canceled, false);

        assert_eq!(metrics.orders_total.with_label_values(&["Filled"]).get(), 2.0);
        assert_eq!(metrics.fills_total.get(), 1.0);
    }

    #[test]
    fn test_run_events_drive_gauges() {
        let metrics = EngineMetrics::new().unwrap();
        let stale = RunEvent::SubscriptionStale {
            subscription: SubscriptionId(0),
            symbol: "SPY".to_string(),
            since: Utc::now(),
            missing_periods: 4,
        };
        metrics.on_event(&stale);
        metrics.on_event(&stale);
        metrics.on_event(&RunEvent::SubscriptionResumed {
            subscription: SubscriptionId(0),
            symbol: "SPY".to_string(),
            at: Utc::now(),
        });
        assert_eq!(metrics.stale_subscriptions.get(), 1.0);
    }
}
