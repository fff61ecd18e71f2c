// Strategy pipeline contracts
pub mod insight;
pub mod models;
pub mod target;
