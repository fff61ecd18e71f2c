use crate::domain::strategy::models::{AlgorithmState, ExecutionModel};
use crate::domain::strategy::target::PortfolioTarget;
use crate::domain::trading::types::{OrderRequest, SubmitOrderRequest};
use anyhow::Result;
use tracing::debug;

/// Sends a market order for the gap between each target and the current holding
/// plus any unfilled open quantity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateExecution;

impl ExecutionModel for ImmediateExecution {
    fn execute(
        &mut self,
        targets: &[PortfolioTarget],
        state: &AlgorithmState<'_>,
    ) -> Result<Vec<OrderRequest>> {
        let investable = state.investable_equity();
        let mut requests = Vec::new();
        for target in targets {
            let Some(quantity) = target.resolve_quantity(state.price(&target.symbol), investable) else {
                debug!(
                    "ImmediateExecution: no price for {}, skipping target",
                    target.symbol
                );
                continue;
            };
            let delta = quantity - state.holding(&target.symbol) - state.open_quantity(&target.symbol);
            if delta.is_zero() {
                continue;
            }
            requests.push(OrderRequest::Submit(
                SubmitOrderRequest::market(target.symbol.clone(), delta).with_tag("ImmediateExecution"),
            ));
        }
        Ok(requests)
    }
}
