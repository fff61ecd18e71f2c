// Core trading domain entities and value objects
pub mod fee_model;
pub mod order;
pub mod portfolio;
pub mod types;
