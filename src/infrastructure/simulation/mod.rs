pub mod simulated_brokerage;
pub mod slippage_model;

pub use simulated_brokerage::{SimulatedBrokerage, SimulatedBrokerageSettings, SimulatedOperation};
