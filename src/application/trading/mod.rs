pub mod brokerage_gateway;
pub mod transaction_manager;
