// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Metrics agent core: statsd ingestion, aggregation, check scheduling and
//! supervision of the external collector bridge.

pub mod agent;
pub mod aggregator;
pub mod bridge;
pub mod check;
pub mod cli;
pub mod config;
pub mod metric;
pub mod pidfile;
pub mod reporter;
pub mod scheduler;
pub mod server;
pub mod services;
pub mod statsd;

pub use agent::{Agent, Collaborators};
pub use aggregator::{Aggregator, FlushSnapshot, FlushedMetric};
pub use bridge::{BridgeState, BridgeSupervisor};
pub use check::Check;
pub use config::AgentConfig;
pub use metric::{MetricSample, MetricType};
pub use scheduler::Scheduler;
pub use server::Server;
