//! Alpha → portfolio construction → risk → execution, once per slice.
//!
//! Every stage runs behind a fault boundary: an error or a panic inside a model
//! becomes a [`StageFault`] naming the stage, and the engine turns that into a
//! halted run with a diagnostic snapshot.

use crate::application::strategies::insight_collection::{InsightCollection, InsightMergePolicy};
use crate::domain::market::slice::Slice;
use crate::domain::strategy::models::{
    AlgorithmState, AlphaModel, ExecutionModel, PipelineStage, PortfolioConstructionModel,
    RiskManagementModel,
};
use crate::domain::strategy::target::{PortfolioTarget, TargetAmount};
use crate::domain::trading::types::OrderRequest;
use rust_decimal::Decimal;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{stage} stage failed: {message}")]
pub struct StageFault {
    pub stage: PipelineStage,
    pub message: String,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic with non-string payload".to_string()
    }
}

fn guarded<T>(stage: PipelineStage, f: impl FnOnce() -> anyhow::Result<T>) -> Result<T, StageFault> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(StageFault {
            stage,
            message: format!("{:#}", e),
        }),
        Err(payload) => Err(StageFault {
            stage,
            message: panic_message(payload),
        }),
    }
}

pub struct StrategyPipeline {
    alphas: Vec<Box<dyn AlphaModel>>,
    insights: InsightCollection,
    construction: Box<dyn PortfolioConstructionModel>,
    risk: Box<dyn RiskManagementModel>,
    execution: Box<dyn ExecutionModel>,
}

impl StrategyPipeline {
    pub fn new(
        alphas: Vec<Box<dyn AlphaModel>>,
        merge_policy: InsightMergePolicy,
        construction: Box<dyn PortfolioConstructionModel>,
        risk: Box<dyn RiskManagementModel>,
        execution: Box<dyn ExecutionModel>,
    ) -> Self {
        Self {
            alphas,
            insights: InsightCollection::new(merge_policy),
            construction,
            risk,
            execution,
        }
    }

    pub fn active_insights(&self) -> usize {
        self.insights.len()
    }

    /// Runs all stages for one slice and returns the order requests to process.
    ///
    /// Construction and later stages only run when the insight set changed on this slice.
    pub fn run(&mut self, slice: &Slice, state: &AlgorithmState<'_>) -> Result<Vec<OrderRequest>, StageFault> {
        let mut changed = false;
        for alpha in self.alphas.iter_mut() {
            let name = alpha.name().to_string();
            let produced = guarded(PipelineStage::Alpha, || alpha.update(slice, state))?;
            for mut insight in produced {
                if insight.source.is_empty() {
                    insight.source = name.clone();
                }
                self.insights.add(insight);
                changed = true;
            }
        }

        let closed = self.insights.remove_expired(state.time);
        if !changed && closed.is_empty() {
            return Ok(Vec::new());
        }

        let merged = self.insights.merged(state.time, &closed);
        let targets = guarded(PipelineStage::PortfolioConstruction, || {
            self.construction.create_targets(&merged, state)
        })?;
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let adjusted = guarded(PipelineStage::RiskManagement, || {
            self.risk.manage_risk(&targets, state)
        })?;
        let adjusted = clamp_risk_output(&targets, adjusted);
        if adjusted.is_empty() {
            return Ok(Vec::new());
        }

        let requests = guarded(PipelineStage::Execution, || {
            self.execution.execute(&adjusted, state)
        })?;
        debug!(
            "StrategyPipeline: {} insights -> {} targets -> {} requests at {}",
            merged.len(),
            adjusted.len(),
            requests.len(),
            state.time
        );
        Ok(requests)
    }
}

fn signed(amount: TargetAmount) -> (Decimal, bool) {
    match amount {
        TargetAmount::Quantity(q) => (q, false),
        TargetAmount::Weight(w) => (w, true),
    }
}

/// Risk output may only shrink or drop input targets; anything else is reverted.
pub fn clamp_risk_output(input: &[PortfolioTarget], output: Vec<PortfolioTarget>) -> Vec<PortfolioTarget> {
    let original: HashMap<&str, &PortfolioTarget> =
        input.iter().map(|t| (t.symbol.as_str(), t)).collect();

    let mut seen = BTreeMap::new();
    for target in output {
        let Some(source) = original.get(target.symbol.as_str()) else {
            warn!(
                "StrategyPipeline: risk model added target for {} not present in input, dropping",
                target.symbol
            );
            continue;
        };
        if seen.contains_key(&target.symbol) {
            warn!(
                "StrategyPipeline: risk model returned {} twice, keeping the first",
                target.symbol
            );
            continue;
        }

        let (value, is_weight) = signed(target.amount);
        let (limit, limit_is_weight) = signed(source.amount);
        let enlarged = is_weight != limit_is_weight
            || value.abs() > limit.abs()
            || (!value.is_zero() && value.is_sign_negative() != limit.is_sign_negative());
        if enlarged {
            warn!(
                "StrategyPipeline: risk model enlarged {} ({:?} -> {:?}), clamping to input",
                target.symbol, source.amount, target.amount
            );
            seen.insert(target.symbol.clone(), (*source).clone());
        } else {
            seen.insert(target.symbol.clone(), target);
        }
    }
    seen.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::strategy::insight::Insight;
    use crate::domain::trading::portfolio::Portfolio;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    struct ScriptedAlpha {
        fire_on: Vec<DateTime<Utc>>,
        panic_on: Option<DateTime<Utc>>,
    }

    impl AlphaModel for ScriptedAlpha {
        fn name(&self) -> &str {
            "scripted"
        }

        fn update(&mut self, slice: &Slice, _state: &AlgorithmState<'_>) -> anyhow::Result<Vec<Insight>> {
            if self.panic_on == Some(slice.time()) {
                panic!("indicator exploded");
            }
            if self.fire_on.contains(&slice.time()) {
                return Ok(vec![Insight::up("SPY", Duration::minutes(5), slice.time())]);
            }
            Ok(Vec::new())
        }
    }

    struct CountingConstruction {
        calls: usize,
    }

    impl PortfolioConstructionModel for CountingConstruction {
        fn create_targets(
            &mut self,
            insights: &[Insight],
            _state: &AlgorithmState<'_>,
        ) -> anyhow::Result<Vec<PortfolioTarget>> {
            self.calls += 1;
            Ok(insights
                .iter()
                .map(|i| PortfolioTarget::quantity(i.symbol.clone(), Decimal::from(i.direction.sign() as i64 * 10)))
                .collect())
        }
    }

    struct PassRisk;

    impl RiskManagementModel for PassRisk {
        fn manage_risk(
            &mut self,
            targets: &[PortfolioTarget],
            _state: &AlgorithmState<'_>,
        ) -> anyhow::Result<Vec<PortfolioTarget>> {
            Ok(targets.to_vec())
        }
    }

    struct FailingExecution;

    impl ExecutionModel for FailingExecution {
        fn execute(
            &mut self,
            _targets: &[PortfolioTarget],
            _state: &AlgorithmState<'_>,
        ) -> anyhow::Result<Vec<OrderRequest>> {
            anyhow::bail!("venue mapping missing")
        }
    }

    struct MarketExecution;

    impl ExecutionModel for MarketExecution {
        fn execute(
            &mut self,
            targets: &[PortfolioTarget],
            _state: &AlgorithmState<'_>,
        ) -> anyhow::Result<Vec<OrderRequest>> {
            Ok(targets
                .iter()
                .filter_map(|t| match t.amount {
                    TargetAmount::Quantity(q) if !q.is_zero() => Some(OrderRequest::Submit(
                        crate::domain::trading::types::SubmitOrderRequest::market(t.symbol.clone(), q),
                    )),
                    _ => None,
                })
                .collect())
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 15, minute, 0).unwrap()
    }

    fn run_at(pipeline: &mut StrategyPipeline, minute: u32) -> Result<Vec<OrderRequest>, StageFault> {
        let portfolio = Portfolio::new(dec!(10000));
        let prices = HashMap::new();
        let universe = vec!["SPY".to_string()];
        let state = AlgorithmState {
            time: at(minute),
            portfolio: &portfolio,
            open_orders: Vec::new(),
            prices: &prices,
            universe: &universe,
            cash_buffer: Decimal::ZERO,
        };
        let slice = Slice::new(at(minute), BTreeMap::new());
        pipeline.run(&slice, &state)
    }

    #[test]
    fn test_construction_runs_only_on_change() {
        let alpha = ScriptedAlpha {
            fire_on: vec![at(0)],
            panic_on: None,
        };
        let mut pipeline = StrategyPipeline::new(
            vec![Box::new(alpha)],
            InsightMergePolicy::ConfidenceWeighted,
            Box::new(CountingConstruction { calls: 0 }),
            Box::new(PassRisk),
            Box::new(MarketExecution),
        );

        assert_eq!(run_at(&mut pipeline, 0).unwrap().len(), 1);
        assert!(run_at(&mut pipeline, 1).unwrap().is_empty());
        // Expiry at minute 5 produces a flat insight and a zero target
        assert!(run_at(&mut pipeline, 5).unwrap().is_empty());
        assert_eq!(pipeline.active_insights(), 0);
    }

    #[test]
    fn test_panic_becomes_stage_fault() {
        let alpha = ScriptedAlpha {
            fire_on: Vec::new(),
            panic_on: Some(at(3)),
        };
        let mut pipeline = StrategyPipeline::new(
            vec![Box::new(alpha)],
            InsightMergePolicy::ConfidenceWeighted,
            Box::new(CountingConstruction { calls: 0 }),
            Box::new(PassRisk),
            Box::new(MarketExecution),
        );

        let fault = run_at(&mut pipeline, 3).unwrap_err();
        assert_eq!(fault.stage, PipelineStage::Alpha);
        assert!(fault.message.contains("indicator exploded"));
    }

    #[test]
    fn test_error_names_failing_stage() {
        let alpha = ScriptedAlpha {
            fire_on: vec![at(0)],
            panic_on: None,
        };
        let mut pipeline = StrategyPipeline::new(
            vec![Box::new(alpha)],
            InsightMergePolicy::ConfidenceWeighted,
            Box::new(CountingConstruction { calls: 0 }),
            Box::new(PassRisk),
            Box::new(FailingExecution),
        );

        let fault = run_at(&mut pipeline, 0).unwrap_err();
        assert_eq!(fault.stage, PipelineStage::Execution);
    }

    #[test]
    fn test_risk_clamping() {
        let input = vec![
            PortfolioTarget::quantity("AAA", dec!(100)),
            PortfolioTarget::weight("BBB", dec!(0.5)),
            PortfolioTarget::quantity("CCC", dec!(-40)),
        ];
        let output = vec![
            PortfolioTarget::quantity("AAA", dec!(150)),
            PortfolioTarget::weight("BBB", dec!(0.2)),
            PortfolioTarget::quantity("CCC", dec!(40)),
            PortfolioTarget::quantity("ZZZ", dec!(1)),
        ];

        let clamped = clamp_risk_output(&input, output);
        assert_eq!(
            clamped,
            vec![
                PortfolioTarget::quantity("AAA", dec!(100)),
                PortfolioTarget::weight("BBB", dec!(0.2)),
                PortfolioTarget::quantity("CCC", dec!(-40)),
            ]
        );
    }
}
