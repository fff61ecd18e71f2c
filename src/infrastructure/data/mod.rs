// Data source adapters
pub mod in_memory_source;
pub mod synthetic;

pub use in_memory_source::InMemoryDataSource;
