// Run ownership and the engines driving it
pub mod backtest_engine;
pub mod engine_core;
pub mod live_engine;
pub mod run_context;
pub mod shutdown_service;

pub use backtest_engine::BacktestEngine;
pub use live_engine::{LiveEngine, LiveSettings};
pub use run_context::{RunContext, RunSettings};
pub use shutdown_service::{ShutdownService, ShutdownSettings};
