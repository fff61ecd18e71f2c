pub mod equal_weighting;
pub mod immediate_execution;
pub mod insight_collection;
pub mod pipeline;
pub mod risk_models;
pub mod sma_cross_alpha;
