pub mod clock;
pub mod core;
pub mod data;
pub mod event_bus;
pub mod observability;
pub mod results;
pub mod simulation;

pub use event_bus::EventBus;
