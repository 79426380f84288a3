// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::aggregator::Aggregator;
use crate::metric::MetricSample;
use crate::server::Server;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A unit of scheduled work. The scheduler only ever sees this trait.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    async fn run(&self) -> Result<Vec<MetricSample>>;
}

/// Reports the agent's own ingestion and aggregation counters.
pub struct AgentStatsCheck {
    interval: Duration,
    aggregator: Arc<Aggregator>,
    server: Option<Arc<Server>>,
}

impl AgentStatsCheck {
    pub fn new(interval: Duration, aggregator: Arc<Aggregator>, server: Option<Arc<Server>>) -> Self {
        Self {
            interval,
            aggregator,
            server,
        }
    }
}

#[async_trait]
impl Check for AgentStatsCheck {
    fn name(&self) -> &str {
        "agent_stats"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<Vec<MetricSample>> {
        let agg = self.aggregator.stats();
        let mut samples = vec![
            MetricSample::gauge("monagent.aggregator.accepted", agg.accepted as f64),
            MetricSample::gauge("monagent.aggregator.rejected", agg.rejected as f64),
            MetricSample::gauge("monagent.aggregator.flushes", agg.flushes as f64),
        ];
        if let Some(server) = &self.server {
            let stats = server.stats();
            samples.push(MetricSample::gauge(
                "monagent.statsd.packets",
                stats.packets as f64,
            ));
            samples.push(MetricSample::gauge(
                "monagent.statsd.parse_errors_total",
                stats.parse_errors as f64,
            ));
        }
        Ok(samples)
    }
}
