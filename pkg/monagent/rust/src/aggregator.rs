// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! In-process metric aggregation.
//!
//! Submissions land in a live window guarded by a single mutex. `flush` swaps
//! that window for an empty one and builds the snapshot from the retired
//! window without holding the submit lock. Gauges and rates keep their
//! cross-flush memory on the flush side, behind a second mutex that also
//! serializes concurrent flushes.

use crate::metric::{Dimensions, MetricKey, MetricSample, MetricType};
use log::debug;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const DEFAULT_PERCENTILES: &[f64] = &[0.95];
pub const DEFAULT_HISTOGRAM_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Error, PartialEq)]
pub enum SubmitError {
    #[error("metric name is empty")]
    EmptyName,
    #[error("{name}: value {value} is not finite")]
    NonFiniteValue { name: String, value: f64 },
    #[error("{name}: sample rate {rate} is outside (0, 1]")]
    InvalidSampleRate { name: String, rate: f64 },
    #[error("{key}: submitted as {submitted} but already tracked as {existing}")]
    TypeConflict {
        key: String,
        existing: MetricType,
        submitted: MetricType,
    },
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub hostname: String,
    /// Percentiles emitted for histograms, each in (0, 1].
    pub percentiles: Vec<f64>,
    pub histogram_buffer_size: usize,
}

impl AggregatorConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            percentiles: DEFAULT_PERCENTILES.to_vec(),
            histogram_buffer_size: DEFAULT_HISTOGRAM_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct RatePoint {
    value: f64,
    at: f64,
}

#[derive(Debug)]
struct HistogramState {
    values: Vec<f64>,
    count: f64,
    sum: f64,
    min: f64,
    max: f64,
}

#[derive(Debug)]
enum Accumulator {
    Counter(f64),
    Gauge(f64),
    Rate {
        first: RatePoint,
        last: RatePoint,
        samples: usize,
    },
    Histogram(HistogramState),
    Set(HashSet<u64>),
}

impl Accumulator {
    fn new(sample: &MetricSample, buffer_size: usize) -> Self {
        let value = sample.value();
        match sample.metric_type() {
            MetricType::Counter => Accumulator::Counter(value / sample.sample_rate()),
            MetricType::Gauge => Accumulator::Gauge(value),
            MetricType::Rate => {
                let point = RatePoint {
                    value,
                    at: seconds(sample.timestamp().unwrap_or_else(SystemTime::now)),
                };
                Accumulator::Rate {
                    first: point,
                    last: point,
                    samples: 1,
                }
            }
            MetricType::Histogram => {
                let mut values = Vec::with_capacity(buffer_size.min(64));
                if buffer_size > 0 {
                    values.push(value);
                }
                let weight = 1.0 / sample.sample_rate();
                Accumulator::Histogram(HistogramState {
                    values,
                    count: weight,
                    sum: value * weight,
                    min: value,
                    max: value,
                })
            }
            MetricType::Set => Accumulator::Set(HashSet::from([set_member(value)])),
        }
    }

    fn metric_type(&self) -> MetricType {
        match self {
            Accumulator::Counter(_) => MetricType::Counter,
            Accumulator::Gauge(_) => MetricType::Gauge,
            Accumulator::Rate { .. } => MetricType::Rate,
            Accumulator::Histogram(_) => MetricType::Histogram,
            Accumulator::Set(_) => MetricType::Set,
        }
    }

    fn apply(&mut self, sample: &MetricSample, buffer_size: usize) {
        let value = sample.value();
        match self {
            Accumulator::Counter(sum) => *sum += value / sample.sample_rate(),
            Accumulator::Gauge(last) => *last = value,
            Accumulator::Rate { last, samples, .. } => {
                *last = RatePoint {
                    value,
                    at: seconds(sample.timestamp().unwrap_or_else(SystemTime::now)),
                };
                *samples += 1;
            }
            Accumulator::Histogram(h) => {
                let weight = 1.0 / sample.sample_rate();
                h.count += weight;
                h.sum += value * weight;
                h.min = h.min.min(value);
                h.max = h.max.max(value);
                if h.values.len() < buffer_size {
                    h.values.push(value);
                }
            }
            Accumulator::Set(members) => {
                members.insert(set_member(value));
            }
        }
    }
}

// -0.0 and 0.0 are the same member.
fn set_member(value: f64) -> u64 {
    if value == 0.0 { 0 } else { value.to_bits() }
}

fn seconds(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlushedMetric {
    pub name: String,
    pub dimensions: Dimensions,
    pub host: String,
    pub value: f64,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub timestamp: u64,
}

/// Result of one flush. Metrics are sorted by name, then dimensions.
#[derive(Debug, Clone, Serialize)]
pub struct FlushSnapshot {
    timestamp: u64,
    metrics: Vec<FlushedMetric>,
}

impl FlushSnapshot {
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn metrics(&self) -> &[FlushedMetric] {
        &self.metrics
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// First metric with this flushed name, whatever its dimensions.
    pub fn get(&self, name: &str) -> Option<&FlushedMetric> {
        self.metrics.iter().find(|m| m.name == name)
    }

    pub fn find(&self, name: &str, dimensions: &Dimensions) -> Option<&FlushedMetric> {
        self.metrics
            .iter()
            .find(|m| m.name == name && &m.dimensions == dimensions)
    }
}

#[derive(Debug, Default)]
struct FlushMemory {
    gauges: HashMap<MetricKey, f64>,
    rates: HashMap<MetricKey, RatePoint>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub accepted: u64,
    pub rejected: u64,
    pub flushes: u64,
}

pub struct Aggregator {
    config: AggregatorConfig,
    live: Mutex<HashMap<MetricKey, Accumulator>>,
    memory: Mutex<FlushMemory>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    flushes: AtomicU64,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            live: Mutex::new(HashMap::new()),
            memory: Mutex::new(FlushMemory::default()),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn with_hostname(hostname: impl Into<String>) -> Self {
        Self::new(AggregatorConfig::new(hostname))
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }

    pub fn submit(&self, sample: MetricSample) -> Result<(), SubmitError> {
        if let Err(e) = self.validate(&sample) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("rejected sample: {e}");
            return Err(e);
        }

        let buffer_size = self.config.histogram_buffer_size;
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(acc) = live.get_mut(sample.key()) {
            let existing = acc.metric_type();
            if existing != sample.metric_type() {
                drop(live);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                let e = SubmitError::TypeConflict {
                    key: sample.key().to_string(),
                    existing,
                    submitted: sample.metric_type(),
                };
                debug!("rejected sample: {e}");
                return Err(e);
            }
            acc.apply(&sample, buffer_size);
        } else {
            let acc = Accumulator::new(&sample, buffer_size);
            live.insert(sample.key().clone(), acc);
        }
        drop(live);

        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn validate(&self, sample: &MetricSample) -> Result<(), SubmitError> {
        if sample.name().is_empty() {
            return Err(SubmitError::EmptyName);
        }
        if !sample.value().is_finite() {
            return Err(SubmitError::NonFiniteValue {
                name: sample.name().to_string(),
                value: sample.value(),
            });
        }
        let rate = sample.sample_rate();
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(SubmitError::InvalidSampleRate {
                name: sample.name().to_string(),
                rate,
            });
        }
        Ok(())
    }

    pub fn flush(&self) -> FlushSnapshot {
        // Held for the whole flush: one snapshot at a time.
        let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);

        let retired = {
            let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *live)
        };

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut metrics = Vec::with_capacity(retired.len() + memory.gauges.len());

        for (key, acc) in retired {
            // A key that changed type replaces its remembered series.
            if !matches!(acc, Accumulator::Gauge(_)) && memory.gauges.remove(&key).is_some() {
                debug!("{key} is now a {}, forgetting its gauge", acc.metric_type());
            }
            if !matches!(acc, Accumulator::Rate { .. }) {
                memory.rates.remove(&key);
            }
            match acc {
                Accumulator::Gauge(value) => {
                    memory.gauges.insert(key, value);
                }
                Accumulator::Counter(sum) => {
                    metrics.push(self.emit(&key, "", sum, MetricType::Counter, timestamp));
                }
                Accumulator::Rate {
                    first,
                    last,
                    samples,
                } => {
                    let prev = match memory.rates.get(&key) {
                        Some(prev) => Some(*prev),
                        None if samples > 1 => Some(first),
                        None => None,
                    };
                    if let Some(prev) = prev {
                        let elapsed = last.at - prev.at;
                        if elapsed > 0.0 {
                            let rate = (last.value - prev.value) / elapsed;
                            metrics.push(self.emit(&key, "", rate, MetricType::Rate, timestamp));
                        }
                    }
                    memory.rates.insert(key, last);
                }
                Accumulator::Histogram(h) => {
                    self.emit_histogram(&key, h, timestamp, &mut metrics);
                }
                Accumulator::Set(members) => {
                    metrics.push(self.emit(
                        &key,
                        "",
                        members.len() as f64,
                        MetricType::Set,
                        timestamp,
                    ));
                }
            }
        }

        for (key, value) in &memory.gauges {
            metrics.push(self.emit(key, "", *value, MetricType::Gauge, timestamp));
        }
        drop(memory);

        metrics.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.dimensions.cmp(&b.dimensions))
        });

        self.flushes.fetch_add(1, Ordering::Relaxed);
        debug!("flushed {} metric(s)", metrics.len());
        FlushSnapshot { timestamp, metrics }
    }

    fn emit(
        &self,
        key: &MetricKey,
        suffix: &str,
        value: f64,
        metric_type: MetricType,
        timestamp: u64,
    ) -> FlushedMetric {
        let name = if suffix.is_empty() {
            key.name.clone()
        } else {
            format!("{}.{suffix}", key.name)
        };
        FlushedMetric {
            name,
            dimensions: key.dimensions.clone(),
            host: self.config.hostname.clone(),
            value,
            metric_type,
            timestamp,
        }
    }

    fn emit_histogram(
        &self,
        key: &MetricKey,
        mut h: HistogramState,
        timestamp: u64,
        out: &mut Vec<FlushedMetric>,
    ) {
        let t = MetricType::Histogram;
        out.push(self.emit(key, "count", h.count, t, timestamp));
        out.push(self.emit(key, "sum", h.sum, t, timestamp));
        out.push(self.emit(key, "min", h.min, t, timestamp));
        out.push(self.emit(key, "max", h.max, t, timestamp));
        out.push(self.emit(key, "avg", h.sum / h.count, t, timestamp));

        if h.values.is_empty() {
            return;
        }
        h.values.sort_by(f64::total_cmp);
        for p in &self.config.percentiles {
            let value = percentile(&h.values, *p);
            let suffix = percentile_suffix(*p);
            out.push(self.emit(key, &suffix, value, t, timestamp));
        }
    }
}

/// Histogram field name for percentile `p`, e.g. `95percentile` for 0.95.
pub fn percentile_suffix(p: f64) -> String {
    format!("{}percentile", (p * 100.0).round() as u32)
}

/// Nearest-rank percentile over sorted, non-empty `values`.
fn percentile(values: &[f64], p: f64) -> f64 {
    let n = values.len();
    let rank = (p * n as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(n - 1);
    values.get(idx).copied().unwrap_or(f64::NAN)
}
