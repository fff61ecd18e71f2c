use crate::domain::strategy::insight::{Insight, InsightDirection};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use tracing::debug;

/// How insights from several alpha models on the same symbol are combined.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightMergePolicy {
    /// Confidence-weighted mean of signed magnitudes
    #[default]
    ConfidenceWeighted,
    /// The insight of the highest-ranked source wins; unlisted sources rank after, by name
    Precedence(Vec<String>),
}

impl FromStr for InsightMergePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "confidence_weighted" | "confidence" | "weighted" => {
                Ok(InsightMergePolicy::ConfidenceWeighted)
            }
            "precedence" => Ok(InsightMergePolicy::Precedence(Vec::new())),
            _ => anyhow::bail!(
                "Invalid merge policy: {}. Must be 'confidence_weighted' or 'precedence'",
                s
            ),
        }
    }
}

/// Active insights keyed by (symbol, source). At most one per key: a newer insight
/// from the same source replaces the older one.
#[derive(Debug, Default)]
pub struct InsightCollection {
    policy: InsightMergePolicy,
    active: BTreeMap<(String, String), Insight>,
}

impl InsightCollection {
    pub fn new(policy: InsightMergePolicy) -> Self {
        Self {
            policy,
            active: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, insight: Insight) {
        let key = (insight.symbol.clone(), insight.source.clone());
        self.active.insert(key, insight);
    }

    /// Drops insights expired at `at`; returns symbols left without any active insight.
    pub fn remove_expired(&mut self, at: DateTime<Utc>) -> BTreeSet<String> {
        let mut touched = BTreeSet::new();
        self.active.retain(|(symbol, _), insight| {
            let keep = insight.is_active(at);
            if !keep {
                touched.insert(symbol.clone());
            }
            keep
        });
        touched
            .into_iter()
            .filter(|symbol| !self.has_symbol(symbol))
            .collect()
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.active.keys().any(|(s, _)| s == symbol)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// One merged insight per symbol, sorted by symbol. Symbols in `closed` get a Flat insight.
    pub fn merged(&self, at: DateTime<Utc>, closed: &BTreeSet<String>) -> Vec<Insight> {
        let mut by_symbol: BTreeMap<&str, Vec<&Insight>> = BTreeMap::new();
        for ((symbol, _), insight) in &self.active {
            by_symbol.entry(symbol.as_str()).or_default().push(insight);
        }

        let mut merged: Vec<Insight> = by_symbol
            .into_iter()
            .map(|(symbol, insights)| self.merge_symbol(symbol, &insights, at))
            .collect();
        for symbol in closed {
            if !self.has_symbol(symbol) {
                merged.push(
                    Insight::flat(symbol.clone(), Duration::zero(), at).with_source("expired"),
                );
            }
        }
        merged.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        merged
    }

    fn merge_symbol(&self, symbol: &str, insights: &[&Insight], at: DateTime<Utc>) -> Insight {
        if let [single] = insights {
            return (*single).clone();
        }
        match &self.policy {
            InsightMergePolicy::Precedence(order) => {
                let rank = |source: &str| order.iter().position(|s| s == source).unwrap_or(order.len());
                let winner = insights
                    .iter()
                    .min_by(|a, b| {
                        rank(&a.source)
                            .cmp(&rank(&b.source))
                            .then_with(|| a.source.cmp(&b.source))
                    })
                    .copied();
                match winner {
                    Some(insight) => insight.clone(),
                    None => Insight::flat(symbol, Duration::zero(), at),
                }
            }
            InsightMergePolicy::ConfidenceWeighted => {
                let total_confidence: f64 = insights.iter().map(|i| i.confidence).sum();
                let value = if total_confidence > 0.0 {
                    insights
                        .iter()
                        .map(|i| i.confidence * i.signed_magnitude())
                        .sum::<f64>()
                        / total_confidence
                } else {
                    insights.iter().map(|i| i.signed_magnitude()).sum::<f64>()
                        / insights.len() as f64
                };
                let expiry = insights
                    .iter()
                    .map(|i| i.expires_at())
                    .max()
                    .unwrap_or(at);
                debug!(
                    "InsightCollection: merged {} insights for {} into {:.4}",
                    insights.len(),
                    symbol,
                    value
                );
                Insight::new(symbol, InsightDirection::from_signed(value), expiry - at, at)
                    .with_magnitude(value.abs())
                    .with_confidence(total_confidence / insights.len() as f64)
                    .with_source("merged")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 15, minute, 0).unwrap()
    }

    #[test]
    fn test_confidence_weighted_merge() {
        let mut collection = InsightCollection::new(InsightMergePolicy::ConfidenceWeighted);
        collection.add(
            Insight::up("SPY", Duration::minutes(10), at(0))
                .with_confidence(0.75)
                .with_source("a"),
        );
        collection.add(
            Insight::down("SPY", Duration::minutes(10), at(0))
                .with_confidence(0.25)
                .with_source("b"),
        );

        let merged = collection.merged(at(1), &BTreeSet::new());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].direction, InsightDirection::Up);
        assert!((merged[0].magnitude - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_precedence_merge_is_total() {
        let policy = InsightMergePolicy::Precedence(vec!["b".to_string()]);
        let mut collection = InsightCollection::new(policy);
        for source in ["c", "a", "b"] {
            collection.add(Insight::up("SPY", Duration::minutes(10), at(0)).with_source(source));
        }
        assert_eq!(collection.merged(at(1), &BTreeSet::new())[0].source, "b");

        let mut unlisted = InsightCollection::new(InsightMergePolicy::Precedence(Vec::new()));
        for source in ["c", "a"] {
            unlisted.add(Insight::down("SPY", Duration::minutes(10), at(0)).with_source(source));
        }
        assert_eq!(unlisted.merged(at(1), &BTreeSet::new())[0].source, "a");
    }

    #[test]
    fn test_expired_symbols_flatten() {
        let mut collection = InsightCollection::default();
        collection.add(Insight::up("SPY", Duration::minutes(5), at(0)).with_source("a"));
        collection.add(Insight::up("QQQ", Duration::minutes(30), at(0)).with_source("a"));

        assert!(collection.remove_expired(at(4)).is_empty());
        let closed = collection.remove_expired(at(5));
        assert_eq!(closed.iter().collect::<Vec<_>>(), vec!["SPY"]);

        let merged = collection.merged(at(5), &closed);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].symbol, "QQQ");
        assert_eq!(merged[1].symbol, "SPY");
        assert_eq!(merged[1].direction, InsightDirection::Flat);
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!(
            "confidence_weighted".parse::<InsightMergePolicy>().unwrap(),
            InsightMergePolicy::ConfidenceWeighted
        );
        assert!("loudest".parse::<InsightMergePolicy>().is_err());
    }
}
