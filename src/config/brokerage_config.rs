use super::parse_env;
use crate::application::system::shutdown_service::ShutdownSettings;
use crate::application::trading::brokerage_gateway::{GatewaySettings, RetryPolicy};
use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

/// Gateway resilience knobs plus the venue's event queue depth.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerageEnvConfig {
    pub call_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub event_queue_capacity: usize,
    pub circuit_failure_threshold: usize,
    pub circuit_reset_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for BrokerageEnvConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            event_queue_capacity: 1024,
            circuit_failure_threshold: 5,
            circuit_reset_ms: 30_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl BrokerageEnvConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            call_timeout_ms: parse_env("BROKER_CALL_TIMEOUT_MS", d.call_timeout_ms)?,
            max_retries: parse_env("BROKER_MAX_RETRIES", d.max_retries)?,
            retry_base_delay_ms: parse_env("BROKER_RETRY_BASE_DELAY_MS", d.retry_base_delay_ms)?,
            retry_max_delay_ms: parse_env("BROKER_RETRY_MAX_DELAY_MS", d.retry_max_delay_ms)?,
            event_queue_capacity: parse_env(
                "BROKER_EVENT_QUEUE_CAPACITY",
                d.event_queue_capacity,
            )?,
            circuit_failure_threshold: parse_env(
                "BROKER_CIRCUIT_FAILURE_THRESHOLD",
                d.circuit_failure_threshold,
            )?,
            circuit_reset_ms: parse_env("BROKER_CIRCUIT_RESET_MS", d.circuit_reset_ms)?,
            shutdown_grace_ms: parse_env("BROKER_SHUTDOWN_GRACE_MS", d.shutdown_grace_ms)?,
        })
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
            circuit_failure_threshold: self.circuit_failure_threshold,
            circuit_reset: Duration::from_millis(self.circuit_reset_ms),
        }
    }

    pub fn shutdown_settings(&self) -> ShutdownSettings {
        ShutdownSettings {
            cancel_open_orders: true,
            grace_period: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}
