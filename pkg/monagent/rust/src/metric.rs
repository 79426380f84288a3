// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use thiserror::Error;

/// Dimensions are kept sorted by key so that insertion order never reaches
/// equality or hashing.
pub type Dimensions = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Rate,
    Histogram,
    Set,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown metric type: {0:?}")]
pub struct UnknownMetricType(pub String);

impl MetricType {
    /// Type tag used on the statsd wire.
    pub fn statsd_token(self) -> &'static str {
        match self {
            MetricType::Counter => "c",
            MetricType::Gauge => "g",
            MetricType::Rate => "ms",
            MetricType::Histogram => "h",
            MetricType::Set => "s",
        }
    }
}

impl FromStr for MetricType {
    type Err = UnknownMetricType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "c" => Ok(MetricType::Counter),
            "g" => Ok(MetricType::Gauge),
            "ms" => Ok(MetricType::Rate),
            "h" => Ok(MetricType::Histogram),
            "s" => Ok(MetricType::Set),
            other => Err(UnknownMetricType(other.to_string())),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricType::Counter => write!(f, "counter"),
            MetricType::Gauge => write!(f, "gauge"),
            MetricType::Rate => write!(f, "rate"),
            MetricType::Histogram => write!(f, "histogram"),
            MetricType::Set => write!(f, "set"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetricKey {
    pub name: String,
    pub dimensions: Dimensions,
}

impl MetricKey {
    pub fn new<I, K, V>(name: impl Into<String>, dimensions: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            dimensions: dimensions
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dimensions: Dimensions::new(),
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.dimensions.is_empty() {
            let dims: Vec<String> = self
                .dimensions
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect();
            write!(f, "{{{}}}", dims.join(","))?;
        }
        Ok(())
    }
}

/// A single observation. Built once through the `with_*` methods, never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    key: MetricKey,
    value: f64,
    metric_type: MetricType,
    sample_rate: f64,
    timestamp: Option<SystemTime>,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, value: f64, metric_type: MetricType) -> Self {
        Self {
            key: MetricKey::named(name),
            value,
            metric_type,
            sample_rate: 1.0,
            timestamp: None,
        }
    }

    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricType::Counter)
    }

    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricType::Gauge)
    }

    pub fn rate(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricType::Rate)
    }

    pub fn histogram(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricType::Histogram)
    }

    pub fn set(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricType::Set)
    }

    pub fn with_dimensions<I, K, V>(mut self, dimensions: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.key
            .dimensions
            .extend(dimensions.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn key(&self) -> &MetricKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn dimensions(&self) -> &Dimensions {
        &self.key.dimensions
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }
}
