//! Everything one run owns: subscriptions, synchronizer, slices, orders, portfolio.
//!
//! There is no shared mutable state between runs. Subscriptions can only change
//! through `&mut RunContext`, which is never borrowed across a frontier advance.

use crate::application::market_data::slice_aggregator::SliceAggregator;
use crate::application::market_data::subscription_registry::{
    DataSources, RegistrySettings, SubscriptionRegistry,
};
use crate::application::market_data::time_synchronizer::{
    SyncPoll, SynchronizerSettings, TimeSynchronizer,
};
use crate::application::strategies::pipeline::StrategyPipeline;
use crate::application::trading::transaction_manager::TransactionManager;
use crate::domain::diagnostics::{DiagnosticSnapshot, RunSummary};
use crate::domain::errors::EngineError;
use crate::domain::events::{RunEvent, RunEventListener};
use crate::domain::market::calendar::CalendarRegistry;
use crate::domain::market::data_point::SubscriptionId;
use crate::domain::market::live_feed::LiveFeedSender;
use crate::domain::market::slice::{FrontierBatch, Slice};
use crate::domain::market::subscription::{Subscription, SubscriptionDescriptor};
use crate::domain::ports::{NoopHooks, ResultsSink, StrategyHooks};
use crate::domain::strategy::models::AlgorithmState;
use crate::domain::trading::fee_model::FeeModel;
use crate::domain::trading::types::{EquityPoint, OrderRequest, TradeRecord};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::observability::EngineMetrics;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub initial_cash: Decimal,
    pub synchronizer: SynchronizerSettings,
    pub registry: RegistrySettings,
    /// Slices kept for diagnostic snapshots
    pub diagnostic_depth: usize,
    pub margin_check: bool,
    /// Fraction of equity weight targets leave uninvested
    pub cash_buffer: Decimal,
    /// Historical window; `None` reads the whole source
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            initial_cash: dec!(100000),
            synchronizer: SynchronizerSettings::default(),
            registry: RegistrySettings::default(),
            diagnostic_depth: 10,
            margin_check: true,
            cash_buffer: dec!(0.0025),
            start: None,
            end: None,
        }
    }
}

pub struct RunContext {
    id: Uuid,
    registry: SubscriptionRegistry,
    synchronizer: TimeSynchronizer,
    aggregator: SliceAggregator,
    transactions: TransactionManager,
    pipeline: StrategyPipeline,
    hooks: Box<dyn StrategyHooks>,
    events: EventBus,
    metrics: Option<EngineMetrics>,
    results: Option<Arc<dyn ResultsSink>>,
    cash_buffer: Decimal,
    start: Option<DateTime<Utc>>,
    universe: Vec<String>,
    current_session: Option<NaiveDate>,
    last_time: Option<DateTime<Utc>>,
}

impl RunContext {
    pub fn new(
        settings: RunSettings,
        calendars: CalendarRegistry,
        sources: DataSources,
        pipeline: StrategyPipeline,
    ) -> Self {
        let id = Uuid::new_v4();
        info!(
            "RunContext: Run {} with cash {}, tolerance {}ms, max fill-forward gap {}",
            id,
            settings.initial_cash,
            settings.synchronizer.time_tolerance.num_milliseconds(),
            settings.synchronizer.max_fill_forward_gap
        );
        Self {
            id,
            registry: SubscriptionRegistry::new(calendars, sources, settings.registry)
                .with_window_end(settings.end),
            synchronizer: TimeSynchronizer::new(settings.synchronizer),
            aggregator: SliceAggregator::new(settings.diagnostic_depth),
            transactions: TransactionManager::new(settings.initial_cash)
                .with_margin_check(settings.margin_check),
            pipeline,
            hooks: Box::new(NoopHooks),
            events: EventBus::new(),
            metrics: None,
            results: None,
            cash_buffer: settings.cash_buffer,
            start: settings.start,
            universe: Vec::new(),
            current_session: None,
            last_time: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Box<dyn StrategyHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_results(mut self, results: Arc<dyn ResultsSink>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_fee_model(mut self, fee_model: Arc<dyn FeeModel>) -> Self {
        self.transactions = self.transactions.with_fee_model(fee_model);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> Option<&EngineMetrics> {
        self.metrics.as_ref()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn synchronizer(&self) -> &TimeSynchronizer {
        &self.synchronizer
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn transactions_mut(&mut self) -> &mut TransactionManager {
        &mut self.transactions
    }

    pub fn universe(&self) -> &[String] {
        &self.universe
    }

    /// Time of the last processed slice.
    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.last_time
    }

    // ===== Subscriptions =====

    pub fn add_subscription(
        &mut self,
        descriptor: SubscriptionDescriptor,
    ) -> Result<Arc<Subscription>, EngineError> {
        // Mid-run additions start at the frontier, not at the run start
        let start = self.synchronizer.last_frontier().or(self.start);
        let (subscription, reader) = self.registry.add(descriptor, start)?;
        self.synchronizer.add_stream(subscription.clone(), reader);
        self.refresh_universe();
        Ok(subscription)
    }

    pub fn add_live_subscription(
        &mut self,
        descriptor: SubscriptionDescriptor,
    ) -> Result<Arc<Subscription>, EngineError> {
        let (subscription, reader) = self.registry.add_live(descriptor)?;
        self.synchronizer.add_stream(subscription.clone(), reader);
        self.refresh_universe();
        Ok(subscription)
    }

    /// Live subscription whose records the caller pushes through the returned sender.
    pub fn add_live_feed(
        &mut self,
        descriptor: SubscriptionDescriptor,
    ) -> Result<(Arc<Subscription>, LiveFeedSender), EngineError> {
        let (subscription, feed, reader) = self.registry.add_live_feed(descriptor)?;
        self.synchronizer.add_stream(subscription.clone(), reader);
        self.refresh_universe();
        Ok((subscription, feed))
    }

    /// Stops emission for a subscription; its already-buffered data still drains.
    pub fn remove_subscription(&mut self, id: SubscriptionId) -> Result<(), EngineError> {
        self.registry.remove(id)?;
        self.synchronizer.remove_stream(id);
        self.refresh_universe();
        Ok(())
    }

    /// Symbols still held stay tradable so they can be closed after removal.
    fn refresh_universe(&mut self) {
        self.universe = self.registry.universe();
        let held = self
            .transactions
            .portfolio()
            .holdings
            .values()
            .filter(|h| !h.quantity.is_zero())
            .map(|h| h.symbol.clone());
        let mut tradable = self.universe.clone();
        tradable.extend(held);
        self.transactions.set_universe(tradable);
    }

    // ===== Frontier =====

    pub fn next_batch(&mut self) -> Result<Option<FrontierBatch>, EngineError> {
        self.synchronizer.advance()
    }

    pub fn poll(&mut self, now: DateTime<Utc>) -> Result<SyncPoll, EngineError> {
        self.synchronizer.poll(now)
    }

    /// Stops ingestion and discards queued data. Returns the discarded count.
    pub fn stop_ingestion(&mut self) -> usize {
        self.synchronizer.shutdown()
    }

    /// Turns a batch into a slice and updates prices. Does not run the pipeline.
    pub fn begin_slice(&mut self, batch: FrontierBatch) -> Arc<Slice> {
        let slice = self.aggregator.aggregate(batch);
        self.transactions.update_prices(&slice);
        self.last_time = Some(slice.time());
        if let Some(metrics) = &self.metrics {
            metrics.record_slice(&slice);
        }

        if let Some(calendar) = self.registry.primary_calendar() {
            let date = calendar.local_date(slice.time());
            if self.current_session != Some(date) {
                debug!("RunContext: Session boundary {}", date);
                self.current_session = Some(date);
                self.hooks
                    .on_session_boundary(date, self.transactions.portfolio());
            }
        }
        slice
    }

    /// Runs the strategy pipeline for a slice against the current portfolio.
    pub fn run_pipeline(&mut self, slice: &Slice) -> Result<Vec<OrderRequest>, EngineError> {
        let state = AlgorithmState {
            time: slice.time(),
            portfolio: self.transactions.portfolio(),
            open_orders: self.transactions.open_orders(),
            prices: self.transactions.prices(),
            universe: &self.universe,
            cash_buffer: self.cash_buffer,
        };
        let result = self.pipeline.run(slice, &state);
        match result {
            Ok(requests) => Ok(requests),
            Err(fault) => {
                let snapshot = self.snapshot();
                error!(
                    "RunContext: Strategy fault in {} at {}: {}\n{}",
                    fault.stage,
                    slice.time(),
                    fault.message,
                    snapshot.to_json()
                );
                Err(EngineError::StrategyFault {
                    stage: fault.stage,
                    message: fault.message,
                    snapshot: Box::new(snapshot),
                })
            }
        }
    }

    /// Delivers everything the synchronizer and transaction manager collected since
    /// the last call: run events to the bus, order events to hooks, fills to the sink.
    pub async fn publish_pending(&mut self) {
        let mut run_events: Vec<RunEvent> = self.synchronizer.take_events();
        run_events.extend(self.transactions.take_run_events());
        if let Some(metrics) = &self.metrics {
            for event in &run_events {
                metrics.on_event(event);
            }
        }
        self.events.publish_all(&run_events).await;

        let order_events = self.transactions.take_order_events();
        let mut held_changed = false;
        for event in &order_events {
            if let Some(metrics) = &self.metrics {
                metrics.record_order_status(event.status, event.is_fill());
            }
            if event.is_fill() {
                held_changed = true;
                if let Some(results) = &self.results {
                    results.record_trade(TradeRecord::from(event));
                }
            }
            self.hooks
                .on_order_event(event, self.transactions.portfolio());
        }
        if held_changed {
            self.refresh_universe();
        }
    }

    pub async fn publish(&mut self, event: RunEvent) {
        if let Some(metrics) = &self.metrics {
            metrics.on_event(&event);
        }
        self.events.publish(&event).await;
    }

    /// Appends the current equity to the results sink.
    pub fn record_equity(&self, time: DateTime<Utc>) {
        let cash = self.transactions.portfolio().cash;
        let equity = self.transactions.equity();
        if let Some(metrics) = &self.metrics {
            metrics.set_portfolio(cash, equity);
        }
        if let Some(results) = &self.results {
            results.record_equity(EquityPoint { time, cash, equity });
        }
    }

    pub fn snapshot(&self) -> DiagnosticSnapshot {
        DiagnosticSnapshot {
            time: self.last_time,
            recent_slices: self.aggregator.recent(),
            open_orders: self
                .transactions
                .open_orders()
                .into_iter()
                .cloned()
                .collect(),
            portfolio: self.transactions.portfolio().clone(),
        }
    }

    /// Final accounting: summary to the hooks, pending results flushed.
    pub fn finish(&mut self, halted_reason: Option<String>, discarded: usize) -> RunSummary {
        let sync = self.synchronizer.stats();
        let tx = self.transactions.stats();
        let portfolio = self.transactions.portfolio();
        let summary = RunSummary {
            slices: self.aggregator.emitted(),
            data_points: sync.data_points,
            fill_forward_points: sync.fill_forward_points,
            out_of_order_points: sync.out_of_order_points,
            orders_submitted: tx.orders_submitted,
            fills: tx.fills,
            dropped_broker_events: tx.dropped_broker_events,
            discarded_data_points: discarded as u64,
            final_cash: portfolio.cash,
            final_equity: self.transactions.equity(),
            realized_pnl: portfolio.realized_pnl,
            halted_reason,
        };
        if let Some(time) = self.last_time {
            self.record_equity(time);
        }
        if let Some(results) = &self.results
            && let Err(e) = results.flush()
        {
            error!("RunContext: Failed to flush results: {:#}", e);
        }
        self.hooks
            .on_end_of_run(&summary, self.transactions.portfolio());
        info!(
            "RunContext: Run {} finished after {} slices, {} fills, equity {}",
            self.id, summary.slices, summary.fills, summary.final_equity
        );
        summary
    }
}
