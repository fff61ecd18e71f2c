use super::parse_env;
use crate::application::strategies::insight_collection::InsightMergePolicy;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineEnvConfig {
    /// "confidence_weighted" or "precedence"
    pub merge_policy: String,
    /// Alpha source names, highest priority first
    pub precedence: Vec<String>,
    pub diagnostic_depth: usize,
    pub margin_check: bool,
}

impl Default for PipelineEnvConfig {
    fn default() -> Self {
        Self {
            merge_policy: "confidence_weighted".to_string(),
            precedence: Vec::new(),
            diagnostic_depth: 10,
            margin_check: true,
        }
    }
}

impl PipelineEnvConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let merge_policy =
            env::var("PIPELINE_MERGE_POLICY").unwrap_or_else(|_| defaults.merge_policy.clone());
        let precedence = env::var("PIPELINE_PRECEDENCE")
            .map(|v| Self::parse_list(&v))
            .unwrap_or_default();

        let config = Self {
            merge_policy,
            precedence,
            diagnostic_depth: parse_env("PIPELINE_DIAGNOSTIC_DEPTH", defaults.diagnostic_depth)?,
            margin_check: parse_env("PIPELINE_MARGIN_CHECK", defaults.margin_check)?,
        };
        config.merge_policy()?;
        Ok(config)
    }

    pub fn merge_policy(&self) -> Result<InsightMergePolicy> {
        let policy = InsightMergePolicy::from_str(&self.merge_policy)
            .context("Failed to parse PIPELINE_MERGE_POLICY")?;
        Ok(match policy {
            InsightMergePolicy::Precedence(_) => {
                InsightMergePolicy::Precedence(self.precedence.clone())
            }
            other => other,
        })
    }

    fn parse_list(value: &str) -> Vec<String> {
        value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
