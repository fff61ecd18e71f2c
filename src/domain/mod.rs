// Diagnostics carried by fatal errors and run summaries
pub mod diagnostics;

// Domain-specific error types
pub mod errors;

// Run-level diagnostic events
pub mod events;

// Market data: resolutions, calendars, subscriptions, slices
pub mod market;

// Port interfaces
pub mod ports;

// Strategy pipeline contracts
pub mod strategy;

// Core trading domain
pub mod trading;

// Data quality checks
pub mod validation;
