//! Live run loop.
//!
//! One task selects over three sources: broker events, a poll interval driving the
//! synchronizer against the clock, and a shutdown signal. A closed event stream
//! triggers reconnection followed by reconciliation.

use crate::application::market_data::time_synchronizer::SyncPoll;
use crate::application::monitoring::heartbeat::SynchronizationWatchdog;
use crate::application::system::engine_core::EngineCore;
use crate::application::system::run_context::RunContext;
use crate::application::system::shutdown_service::{ShutdownService, ShutdownSettings};
use crate::application::trading::brokerage_gateway::{BrokerageGateway, GatewaySettings};
use crate::domain::diagnostics::RunSummary;
use crate::domain::errors::EngineError;
use crate::domain::ports::{Brokerage, Clock};
use crate::domain::trading::types::BrokerEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveSettings {
    pub poll_interval: Duration,
    pub stall_timeout: chrono::Duration,
    /// Stalls in a row that end the run; `None` only reports them
    pub max_consecutive_stalls: Option<u32>,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            stall_timeout: chrono::Duration::seconds(60),
            max_consecutive_stalls: None,
        }
    }
}

enum Step {
    Event(BrokerEvent),
    StreamClosed,
    Poll,
    Stop,
}

async fn next_event(events: &mut Option<Receiver<BrokerEvent>>) -> Option<BrokerEvent> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

pub struct LiveEngine {
    core: EngineCore,
    shutdown: ShutdownService,
    clock: Arc<dyn Clock>,
    settings: LiveSettings,
    watchdog: SynchronizationWatchdog,
    summary: Option<RunSummary>,
}

impl LiveEngine {
    pub fn new(
        context: RunContext,
        brokerage: Arc<dyn Brokerage>,
        clock: Arc<dyn Clock>,
        gateway: GatewaySettings,
        shutdown: ShutdownSettings,
        settings: LiveSettings,
    ) -> Self {
        Self {
            core: EngineCore::new(context, BrokerageGateway::new(brokerage, gateway)),
            shutdown: ShutdownService::new(shutdown),
            clock,
            watchdog: SynchronizationWatchdog::new(
                settings.stall_timeout,
                settings.max_consecutive_stalls,
            ),
            settings,
            summary: None,
        }
    }

    pub fn context(&self) -> &RunContext {
        self.core.context()
    }

    pub fn context_mut(&mut self) -> &mut RunContext {
        self.core.context_mut()
    }

    pub fn summary(&self) -> Option<&RunSummary> {
        self.summary.as_ref()
    }

    /// Runs until `shutdown` turns true, every stream ends, or a fatal error occurs.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<RunSummary, EngineError> {
        info!(
            "LiveEngine: Starting run {} on {}",
            self.core.context().id(),
            self.core.gateway().name()
        );
        if let Err(e) = self.core.connect().await {
            return Err(self.halt(e).await);
        }
        if let Err(e) = self.core.reconcile(self.clock.now()).await {
            warn!("LiveEngine: Initial reconciliation failed: {}", e);
        }

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let mut events = self.core.broker_events.take();
            let step = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        Step::Stop
                    } else {
                        Step::Poll
                    }
                }
                event = next_event(&mut events) => match event {
                    Some(event) => Step::Event(event),
                    None => Step::StreamClosed,
                },
                _ = ticker.tick() => Step::Poll,
            };
            self.core.broker_events = events;

            match step {
                Step::Stop => {
                    info!("LiveEngine: Shutdown requested");
                    break;
                }
                Step::Event(event) => self.core.apply_broker_event(event).await,
                Step::StreamClosed => {
                    warn!("LiveEngine: Broker event stream closed, reconnecting");
                    self.core.broker_events = None;
                    self.reconnect().await;
                }
                Step::Poll => {
                    if !self.core.is_streaming() {
                        self.reconnect().await;
                    }
                    match self.poll_synchronizer().await {
                        Ok(true) => {}
                        Ok(false) => {
                            info!("LiveEngine: All subscriptions ended");
                            break;
                        }
                        Err(e) => return Err(self.halt(e).await),
                    }
                }
            }
        }

        let summary = self.shutdown.shutdown(&mut self.core, None).await;
        self.summary = Some(summary.clone());
        Ok(summary)
    }

    async fn reconnect(&mut self) {
        if let Err(e) = self.core.connect().await {
            warn!("LiveEngine: Reconnect failed: {}", e);
            return;
        }
        if let Err(e) = self.core.reconcile(self.clock.now()).await {
            warn!("LiveEngine: Reconciliation after reconnect failed: {}", e);
        }
    }

    /// Emits every batch that is due at the clock's current time.
    /// Returns `false` at end of stream.
    async fn poll_synchronizer(&mut self) -> Result<bool, EngineError> {
        let now = self.clock.now();
        loop {
            match self.core.context_mut().poll(now)? {
                SyncPoll::Batch(batch) => {
                    self.watchdog.record_progress(now);
                    let slice = self.core.context_mut().begin_slice(batch);
                    self.core.notify_venue(&slice).await;
                    self.core.drain_broker_events().await;

                    let requests = self.core.context_mut().run_pipeline(&slice)?;
                    self.core.dispatch(requests, slice.time()).await;
                    self.core.context().record_equity(slice.time());
                }
                SyncPoll::Pending => {
                    self.core.context_mut().publish_pending().await;
                    if let Some(event) = self.watchdog.check(now)? {
                        self.core.context_mut().publish(event).await;
                    }
                    return Ok(true);
                }
                SyncPoll::EndOfStream => return Ok(false),
            }
        }
    }

    async fn halt(&mut self, error: EngineError) -> EngineError {
        error!("LiveEngine: Halting run: {}", error);
        let summary = self
            .shutdown
            .shutdown(&mut self.core, Some(error.to_string()))
            .await;
        self.summary = Some(summary);
        error
    }
}
