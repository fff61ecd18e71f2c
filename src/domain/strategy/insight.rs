use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InsightDirection {
    Up,
    Down,
    Flat,
}

impl InsightDirection {
    pub fn sign(&self) -> f64 {
        match self {
            InsightDirection::Up => 1.0,
            InsightDirection::Down => -1.0,
            InsightDirection::Flat => 0.0,
        }
    }

    pub fn from_signed(value: f64) -> Self {
        if value > 0.0 {
            InsightDirection::Up
        } else if value < 0.0 {
            InsightDirection::Down
        } else {
            InsightDirection::Flat
        }
    }
}

impl fmt::Display for InsightDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A directional forecast produced by an alpha model.
#[derive(Debug, Clone, PartialEq)]
pub struct Insight {
    pub symbol: String,
    pub direction: InsightDirection,
    /// Expected move size, non-negative
    pub magnitude: f64,
    /// In [0, 1]
    pub confidence: f64,
    pub period: Duration,
    /// Name of the producing alpha model; filled in by the pipeline when empty
    pub source: String,
    pub generated_time: DateTime<Utc>,
}

impl Insight {
    pub fn new(
        symbol: impl Into<String>,
        direction: InsightDirection,
        period: Duration,
        generated_time: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            magnitude: 1.0,
            confidence: 1.0,
            period,
            source: String::new(),
            generated_time,
        }
    }

    pub fn up(symbol: impl Into<String>, period: Duration, time: DateTime<Utc>) -> Self {
        Self::new(symbol, InsightDirection::Up, period, time)
    }

    pub fn down(symbol: impl Into<String>, period: Duration, time: DateTime<Utc>) -> Self {
        Self::new(symbol, InsightDirection::Down, period, time)
    }

    pub fn flat(symbol: impl Into<String>, period: Duration, time: DateTime<Utc>) -> Self {
        Self::new(symbol, InsightDirection::Flat, period, time)
    }

    pub fn with_magnitude(mut self, magnitude: f64) -> Self {
        self.magnitude = magnitude;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.generated_time + self.period
    }

    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        at < self.expires_at()
    }

    pub fn signed_magnitude(&self) -> f64 {
        self.direction.sign() * self.magnitude
    }
}
