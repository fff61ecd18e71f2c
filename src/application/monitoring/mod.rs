// Synchronization health monitoring
pub mod heartbeat;
