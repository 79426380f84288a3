// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Statsd line protocol.
//!
//! `name:value|type[|@sample_rate][|#dim1:val1,dim2:val2][|T<unix_seconds>]`
//! with `type` one of `c`, `g`, `h`, `ms`, `s`. Unknown `|` extensions are
//! ignored.

use crate::metric::{MetricSample, MetricType, UnknownMetricType};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("missing ':' between name and value")]
    MissingColon,
    #[error("empty metric name")]
    EmptyName,
    #[error("missing metric type")]
    MissingType,
    #[error("invalid value {0:?}")]
    InvalidValue(String),
    #[error(transparent)]
    UnknownType(#[from] UnknownMetricType),
    #[error("invalid sample rate {0:?}")]
    InvalidSampleRate(String),
    #[error("invalid dimension {0:?}")]
    InvalidDimension(String),
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
}

pub fn parse_line(line: &str) -> Result<MetricSample, ParseError> {
    let line = line.trim();
    let mut parts = line.split('|');
    let head = parts.next().unwrap_or_default();

    let (name, raw_value) = head.split_once(':').ok_or(ParseError::MissingColon)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ParseError::EmptyName);
    }

    let value = raw_value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParseError::InvalidValue(raw_value.to_string()))?;

    let metric_type: MetricType = match parts.next() {
        Some(token) if !token.trim().is_empty() => token.trim().parse()?,
        _ => return Err(ParseError::MissingType),
    };

    let mut sample = MetricSample::new(name, value, metric_type);
    for ext in parts {
        if let Some(raw) = ext.strip_prefix('@') {
            let rate = raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|r| *r > 0.0 && *r <= 1.0)
                .ok_or_else(|| ParseError::InvalidSampleRate(raw.to_string()))?;
            sample = sample.with_sample_rate(rate);
        } else if let Some(raw) = ext.strip_prefix('#') {
            sample = sample.with_dimensions(parse_dimensions(raw)?);
        } else if let Some(raw) = ext.strip_prefix('T') {
            let at = raw
                .trim()
                .parse::<u64>()
                .ok()
                .and_then(|secs| UNIX_EPOCH.checked_add(Duration::from_secs(secs)))
                .ok_or_else(|| ParseError::InvalidTimestamp(raw.to_string()))?;
            sample = sample.with_timestamp(at);
        }
    }
    Ok(sample)
}

fn parse_dimensions(raw: &str) -> Result<Vec<(String, String)>, ParseError> {
    raw.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| match d.split_once(':') {
            Some((k, v)) if !k.trim().is_empty() => {
                Ok((k.trim().to_string(), v.trim().to_string()))
            }
            _ => Err(ParseError::InvalidDimension(d.to_string())),
        })
        .collect()
}

/// Parse every non-blank line of a datagram independently.
pub fn parse_datagram(payload: &str) -> impl Iterator<Item = Result<MetricSample, ParseError>> + '_ {
    payload
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .map(parse_line)
}

/// Render a sample back to a statsd line.
pub fn format_line(sample: &MetricSample) -> String {
    let mut line = format!(
        "{}:{}|{}",
        sample.name(),
        sample.value(),
        sample.metric_type().statsd_token()
    );
    if sample.sample_rate() < 1.0 {
        line.push_str(&format!("|@{}", sample.sample_rate()));
    }
    if !sample.dimensions().is_empty() {
        let dims: Vec<String> = sample
            .dimensions()
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect();
        line.push_str(&format!("|#{}", dims.join(",")));
    }
    if let Some(ts) = sample.timestamp()
        && let Ok(d) = ts.duration_since(SystemTime::UNIX_EPOCH)
    {
        line.push_str(&format!("|T{}", d.as_secs()));
    }
    line
}
