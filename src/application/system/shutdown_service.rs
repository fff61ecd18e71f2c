use crate::application::system::engine_core::EngineCore;
use crate::domain::diagnostics::RunSummary;
use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSettings {
    pub cancel_open_orders: bool,
    /// How long to wait for cancel acknowledgments
    pub grace_period: Duration,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            cancel_open_orders: true,
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Ends a run in a fixed order: stop ingestion, cancel open orders, wait for the
/// venue, then hand the final state to the results sink and hooks.
pub struct ShutdownService {
    settings: ShutdownSettings,
}

impl ShutdownService {
    pub fn new(settings: ShutdownSettings) -> Self {
        Self { settings }
    }

    pub async fn shutdown(&self, core: &mut EngineCore, halted_reason: Option<String>) -> RunSummary {
        info!("ShutdownService: Initiating shutdown sequence...");

        info!("ShutdownService: Step 1: Stopping ingestion...");
        let discarded = core.context_mut().stop_ingestion();

        let time = core.context().last_time().unwrap_or_else(Utc::now);
        if self.settings.cancel_open_orders {
            info!("ShutdownService: Step 2: Cancelling open orders...");
            let requested = core.cancel_open_orders(time).await;
            if requested > 0 {
                self.await_acknowledgments(core).await;
            }
        } else {
            info!("ShutdownService: Step 2: Cancellation disabled, open orders remain.");
        }
        core.drain_broker_events().await;

        info!("ShutdownService: Step 3: Flushing final state...");
        let summary = core.context_mut().finish(halted_reason, discarded);
        info!("ShutdownService: Shutdown complete.");
        summary
    }

    async fn await_acknowledgments(&self, core: &mut EngineCore) {
        let deadline = tokio::time::Instant::now() + self.settings.grace_period;
        while core
            .context()
            .transactions()
            .open_orders()
            .iter()
            .any(|o| o.flags.cancel_requested)
        {
            let next = {
                let Some(receiver) = core.broker_events.as_mut() else {
                    break;
                };
                tokio::time::timeout_at(deadline, receiver.recv()).await
            };
            match next {
                Ok(Some(event)) => core.apply_broker_event(event).await,
                Ok(None) => {
                    core.broker_events = None;
                    break;
                }
                Err(_) => {
                    let pending = core.context().transactions().open_orders().len();
                    warn!(
                        "ShutdownService: Grace period elapsed with {} orders still open",
                        pending
                    );
                    break;
                }
            }
        }
    }
}
