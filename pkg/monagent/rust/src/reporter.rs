// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::aggregator::{Aggregator, FlushSnapshot, FlushedMetric};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

/// Downstream consumer of flushed snapshots.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, snapshot: &FlushSnapshot) -> Result<()>;
}

/// Writes one JSON object per flushed metric to the log.
pub struct LogReporter;

impl LogReporter {
    pub fn render(metric: &FlushedMetric) -> Result<String> {
        serde_json::to_string(metric).with_context(|| format!("serializing {}", metric.name))
    }
}

#[async_trait]
impl Reporter for LogReporter {
    async fn report(&self, snapshot: &FlushSnapshot) -> Result<()> {
        for metric in snapshot.metrics() {
            info!("{}", Self::render(metric)?);
        }
        Ok(())
    }
}

/// Flush `aggregator` every `interval` and hand non-empty snapshots to
/// `reporter`. A final flush is reported on cancellation.
pub async fn run_reporter(
    aggregator: Arc<Aggregator>,
    reporter: Arc<dyn Reporter>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let period = interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("reporter flushing every {}ms", period.as_millis());
    loop {
        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = ticker.tick() => false,
        };
        flush_once(&aggregator, reporter.as_ref()).await;
        if cancelled {
            break;
        }
    }
    info!("reporter stopped");
}

async fn flush_once(aggregator: &Aggregator, reporter: &dyn Reporter) {
    let snapshot = aggregator.flush();
    if snapshot.is_empty() {
        debug!("flush produced no metrics");
        return;
    }
    debug!("reporting {} metrics", snapshot.len());
    if let Err(e) = reporter.report(&snapshot).await {
        error!("reporter failed: {e:#}");
    }
}
