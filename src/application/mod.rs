// Subscriptions, synchronization and slices
pub mod market_data;

// Run diagnostics
pub mod monitoring;

// Alpha, construction, risk and execution stages
pub mod strategies;

// Run ownership and engines
pub mod system;

pub mod trading;
