use super::{parse_env, parse_optional_env};
use crate::application::market_data::subscription_registry::RegistrySettings;
use crate::application::market_data::time_synchronizer::SynchronizerSettings;
use crate::domain::market::live_feed::OverflowPolicy;
use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SynchronizerEnvConfig {
    pub time_tolerance_ms: u64,
    pub max_fill_forward_gap: u32,
    pub live_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Prefetch queue depth for historical sources (0 = read inline)
    pub prefetch: usize,
    pub stall_timeout_ms: u64,
    pub max_consecutive_stalls: Option<u32>,
}

impl Default for SynchronizerEnvConfig {
    fn default() -> Self {
        Self {
            time_tolerance_ms: 0,
            max_fill_forward_gap: 390,
            live_queue_capacity: 10_000,
            overflow_policy: OverflowPolicy::Block,
            prefetch: 0,
            stall_timeout_ms: 60_000,
            max_consecutive_stalls: None,
        }
    }
}

impl SynchronizerEnvConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            time_tolerance_ms: parse_env("SYNC_TIME_TOLERANCE_MS", defaults.time_tolerance_ms)?,
            max_fill_forward_gap: parse_env(
                "SYNC_MAX_FILL_FORWARD_GAP",
                defaults.max_fill_forward_gap,
            )?,
            live_queue_capacity: parse_env(
                "SYNC_LIVE_QUEUE_CAPACITY",
                defaults.live_queue_capacity,
            )?,
            overflow_policy: parse_env("SYNC_OVERFLOW_POLICY", defaults.overflow_policy)?,
            prefetch: parse_env("SYNC_PREFETCH", defaults.prefetch)?,
            stall_timeout_ms: parse_env("SYNC_STALL_TIMEOUT_MS", defaults.stall_timeout_ms)?,
            max_consecutive_stalls: parse_optional_env("SYNC_MAX_CONSECUTIVE_STALLS")?,
        })
    }

    pub fn synchronizer_settings(&self) -> SynchronizerSettings {
        SynchronizerSettings {
            time_tolerance: chrono::Duration::milliseconds(self.time_tolerance_ms as i64),
            max_fill_forward_gap: self.max_fill_forward_gap,
        }
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            prefetch_capacity: self.prefetch,
            live_queue_capacity: self.live_queue_capacity.max(1),
            overflow_policy: self.overflow_policy,
        }
    }
}
