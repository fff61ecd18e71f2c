// Market data processing modules
pub mod slice_aggregator;
pub mod subscription_reader;
pub mod subscription_registry;
pub mod time_synchronizer;
