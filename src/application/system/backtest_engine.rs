use crate::application::system::engine_core::EngineCore;
use crate::application::system::run_context::RunContext;
use crate::application::system::shutdown_service::{ShutdownService, ShutdownSettings};
use crate::application::trading::brokerage_gateway::{BrokerageGateway, GatewaySettings};
use crate::domain::diagnostics::RunSummary;
use crate::domain::errors::EngineError;
use crate::domain::market::slice::FrontierBatch;
use crate::domain::ports::Brokerage;
use std::sync::Arc;
use tracing::{error, info};

/// Replays historical subscriptions through the pipeline, one slice at a time.
///
/// For every slice the venue sees the data first (orders from the previous slice
/// fill at this slice's prices), then the strategy runs on the updated portfolio.
pub struct BacktestEngine {
    core: EngineCore,
    shutdown: ShutdownService,
    summary: Option<RunSummary>,
}

impl BacktestEngine {
    pub fn new(
        context: RunContext,
        brokerage: Arc<dyn Brokerage>,
        gateway: GatewaySettings,
        shutdown: ShutdownSettings,
    ) -> Self {
        Self {
            core: EngineCore::new(context, BrokerageGateway::new(brokerage, gateway)),
            shutdown: ShutdownService::new(shutdown),
            summary: None,
        }
    }

    pub fn context(&self) -> &RunContext {
        self.core.context()
    }

    /// Subscriptions are added here before `run`.
    pub fn context_mut(&mut self) -> &mut RunContext {
        self.core.context_mut()
    }

    /// Summary of the last run, also available after a halted run.
    pub fn summary(&self) -> Option<&RunSummary> {
        self.summary.as_ref()
    }

    pub async fn run(&mut self) -> Result<RunSummary, EngineError> {
        info!(
            "BacktestEngine: Starting run {} over {} subscriptions",
            self.core.context().id(),
            self.core.context().registry().len()
        );
        if let Err(e) = self.core.connect().await {
            return Err(self.halt(e).await);
        }

        loop {
            let batch = match self.core.context_mut().next_batch() {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => return Err(self.halt(e).await),
            };
            if let Err(e) = self.step(batch).await {
                return Err(self.halt(e).await);
            }
        }

        let summary = self.shutdown.shutdown(&mut self.core, None).await;
        info!(
            "BacktestEngine: Completed {} slices, final equity {}",
            summary.slices, summary.final_equity
        );
        self.summary = Some(summary.clone());
        Ok(summary)
    }

    async fn step(&mut self, batch: FrontierBatch) -> Result<(), EngineError> {
        let slice = self.core.context_mut().begin_slice(batch);
        self.core.notify_venue(&slice).await;
        self.core.drain_broker_events().await;

        let requests = self.core.context_mut().run_pipeline(&slice)?;
        self.core.dispatch(requests, slice.time()).await;
        self.core.drain_broker_events().await;

        self.core.context().record_equity(slice.time());
        Ok(())
    }

    async fn halt(&mut self, error: EngineError) -> EngineError {
        error!("BacktestEngine: Halting run: {}", error);
        let summary = self
            .shutdown
            .shutdown(&mut self.core, Some(error.to_string()))
            .await;
        self.summary = Some(summary);
        error
    }
}
