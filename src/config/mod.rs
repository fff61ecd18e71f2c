//! Configuration module for synctrade.
//!
//! Settings load from environment variables (after `dotenvy::dotenv()`) or from a TOML
//! document with the same structure, grouped by component: Synchronizer, Brokerage and
//! Pipeline.

mod brokerage_config;
mod pipeline_config;
mod synchronizer_config;

pub use brokerage_config::BrokerageEnvConfig;
pub use pipeline_config::PipelineEnvConfig;
pub use synchronizer_config::SynchronizerEnvConfig;

use crate::application::system::live_engine::LiveSettings;
use crate::application::system::run_context::RunSettings;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Run execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Backtest,
    Live,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "backtest" => Ok(Mode::Backtest),
            "live" => Ok(Mode::Live),
            _ => anyhow::bail!("Invalid MODE: {}. Must be 'backtest' or 'live'", s),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    pub initial_cash: Decimal,
    pub synchronizer: SynchronizerEnvConfig,
    pub broker: BrokerageEnvConfig,
    pub pipeline: PipelineEnvConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Backtest,
            initial_cash: dec!(100000),
            synchronizer: SynchronizerEnvConfig::default(),
            broker: BrokerageEnvConfig::default(),
            pipeline: PipelineEnvConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mode_str = env::var("MODE").unwrap_or_else(|_| "backtest".to_string());
        let mode = Mode::from_str(&mode_str)?;
        let initial_cash = parse_env("INITIAL_CASH", dec!(100000))?;

        let synchronizer =
            SynchronizerEnvConfig::from_env().context("Failed to load synchronizer config")?;
        let broker = BrokerageEnvConfig::from_env().context("Failed to load brokerage config")?;
        let pipeline = PipelineEnvConfig::from_env().context("Failed to load pipeline config")?;

        let config = Self {
            mode,
            initial_cash,
            synchronizer,
            broker,
            pipeline,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Failed to parse TOML config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.initial_cash < Decimal::ZERO {
            anyhow::bail!("INITIAL_CASH must not be negative, got {}", self.initial_cash);
        }
        if self.broker.event_queue_capacity == 0 {
            anyhow::bail!("BROKER_EVENT_QUEUE_CAPACITY must be at least 1");
        }
        self.pipeline.merge_policy()?;
        Ok(())
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            initial_cash: self.initial_cash,
            synchronizer: self.synchronizer.synchronizer_settings(),
            registry: self.synchronizer.registry_settings(),
            diagnostic_depth: self.pipeline.diagnostic_depth,
            margin_check: self.pipeline.margin_check,
            ..RunSettings::default()
        }
    }

    pub fn live_settings(&self) -> LiveSettings {
        LiveSettings {
            stall_timeout: chrono::Duration::milliseconds(
                self.synchronizer.stall_timeout_ms as i64,
            ),
            max_consecutive_stalls: self.synchronizer.max_consecutive_stalls,
            poll_interval: Duration::from_millis(100),
        }
    }
}

pub(crate) fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .context(format!("Failed to parse {}", key)),
        Err(_) => Ok(default),
    }
}

/// Unset or empty means `None`.
pub(crate) fn parse_optional_env<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .context(format!("Failed to parse {}", key)),
        _ => Ok(None),
    }
}
