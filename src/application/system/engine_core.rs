//! Order flow shared by the backtest and live engines.
//!
//! Pipeline requests go through the transaction manager first and only then to the
//! brokerage gateway; broker events come back through one bounded channel and are
//! applied in arrival order.

use crate::application::system::run_context::RunContext;
use crate::application::trading::brokerage_gateway::BrokerageGateway;
use crate::application::trading::transaction_manager::{BrokerAction, ReconciliationReport};
use crate::domain::errors::EngineError;
use crate::domain::market::slice::Slice;
use crate::domain::trading::types::{BrokerEvent, OrderId, OrderRequest, OrderStatus};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::Receiver;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

pub struct EngineCore {
    pub(crate) context: RunContext,
    pub(crate) gateway: BrokerageGateway,
    pub(crate) broker_events: Option<Receiver<BrokerEvent>>,
}

impl EngineCore {
    pub fn new(context: RunContext, gateway: BrokerageGateway) -> Self {
        Self {
            context,
            gateway,
            broker_events: None,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut RunContext {
        &mut self.context
    }

    pub fn gateway(&self) -> &BrokerageGateway {
        &self.gateway
    }

    pub fn is_streaming(&self) -> bool {
        self.broker_events.is_some()
    }

    /// Connects and attaches the venue's event stream.
    pub async fn connect(&mut self) -> Result<(), EngineError> {
        self.gateway.connect().await?;
        let events = self.gateway.subscribe_events().await?;
        self.broker_events = Some(events);
        info!("EngineCore: Connected to {}", self.gateway.name());
        Ok(())
    }

    /// Fetches venue order state and brings local orders in line with it.
    pub async fn reconcile(&mut self, time: DateTime<Utc>) -> Result<ReconciliationReport, EngineError> {
        let open = self.gateway.open_orders().await?;
        let recent = self.gateway.recent_orders().await?;
        let report = self
            .context
            .transactions_mut()
            .reconcile(&open, &recent, time);
        self.context.publish_pending().await;
        if report.is_clean() {
            info!("EngineCore: Reconciliation clean: {:?}", report);
        } else {
            warn!("EngineCore: Reconciliation found differences: {:?}", report);
        }
        Ok(report)
    }

    /// Lets the venue see the slice (simulated matching) before the strategy does.
    pub async fn notify_venue(&mut self, slice: &Slice) {
        if let Err(e) = self.gateway.on_slice(slice).await {
            warn!("EngineCore: Venue slice notification failed: {}", e);
        }
    }

    /// Creates, cancels and updates orders for the pipeline's requests, in order.
    pub async fn dispatch(&mut self, requests: Vec<OrderRequest>, time: DateTime<Utc>) {
        for request in requests {
            match request {
                OrderRequest::Submit(submit) => {
                    let id = self.context.transactions_mut().create_order(submit, time);
                    self.send_new_order(id, time).await;
                }
                OrderRequest::Cancel { order_id } => self.cancel(order_id, time).await,
                OrderRequest::Update { order_id, fields } => {
                    match self
                        .context
                        .transactions_mut()
                        .request_update(order_id, fields.clone(), time)
                    {
                        Ok(BrokerAction::Forward(order)) => {
                            if let Err(e) = self.gateway.update(&order, &fields).await {
                                self.context
                                    .transactions_mut()
                                    .on_update_failed(order_id, &e, time);
                            }
                        }
                        Ok(BrokerAction::None) => {}
                        Err(e) => warn!("EngineCore: Update request refused: {}", e),
                    }
                }
            }
        }
        self.context.publish_pending().await;
    }

    async fn send_new_order(&mut self, id: OrderId, time: DateTime<Utc>) {
        let Some(order) = self.context.transactions().order(id).cloned() else {
            return;
        };
        if order.status != OrderStatus::New {
            // Rejected by local validation
            return;
        }
        let outcome = self.gateway.submit(&order).await;
        debug!("EngineCore: Submit {} -> {:?}", id, outcome);
        self.context
            .transactions_mut()
            .on_submit_outcome(id, &outcome, time);
    }

    async fn cancel(&mut self, id: OrderId, time: DateTime<Utc>) {
        match self.context.transactions_mut().request_cancel(id, time) {
            Ok(BrokerAction::Forward(order)) => {
                if let Err(e) = self.gateway.cancel(&order).await {
                    self.context.transactions_mut().on_cancel_failed(id, &e);
                }
            }
            Ok(BrokerAction::None) => {}
            Err(e) => warn!("EngineCore: Cancel request refused: {}", e),
        }
    }

    /// Requests cancellation of every open order.
    pub async fn cancel_open_orders(&mut self, time: DateTime<Utc>) -> usize {
        let open: Vec<OrderId> = self
            .context
            .transactions()
            .open_orders()
            .iter()
            .filter(|o| !o.flags.cancel_requested)
            .map(|o| o.id)
            .collect();
        for id in &open {
            self.cancel(*id, time).await;
        }
        self.context.publish_pending().await;
        open.len()
    }

    /// Applies one broker event and publishes what it produced.
    pub async fn apply_broker_event(&mut self, event: BrokerEvent) {
        self.context.transactions_mut().apply_broker_event(event);
        self.context.publish_pending().await;
    }

    /// Applies every broker event already queued. Returns `false` once the stream closed.
    pub async fn drain_broker_events(&mut self) -> bool {
        let mut open = true;
        if let Some(receiver) = self.broker_events.as_mut() {
            loop {
                match receiver.try_recv() {
                    Ok(event) => {
                        self.context.transactions_mut().apply_broker_event(event);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        warn!("EngineCore: Broker event stream closed");
                        open = false;
                        break;
                    }
                }
            }
        } else {
            open = false;
        }
        if !open {
            self.broker_events = None;
        }
        self.context.publish_pending().await;
        open
    }
}
