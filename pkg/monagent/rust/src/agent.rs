// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::aggregator::Aggregator;
use crate::bridge::{Alerter, BridgeSupervisor, LogAlerter};
use crate::check::AgentStatsCheck;
use crate::config::AgentConfig;
use crate::pidfile::PidFile;
use crate::reporter::{LogReporter, Reporter, run_reporter};
use crate::scheduler::Scheduler;
use crate::server::Server;
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Collaborators that sit outside the agent core.
pub struct Collaborators {
    pub reporter: Arc<dyn Reporter>,
    pub alerter: Arc<dyn Alerter>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            reporter: Arc::new(LogReporter),
            alerter: Arc::new(LogAlerter),
        }
    }
}

/// A started agent. Dropping it without [`Agent::stop`] leaves tasks running
/// until the runtime shuts down.
pub struct Agent {
    aggregator: Arc<Aggregator>,
    server: Arc<Server>,
    server_task: JoinHandle<Result<()>>,
    scheduler: Arc<Scheduler>,
    scheduler_task: JoinHandle<()>,
    bridge: Option<Arc<BridgeSupervisor>>,
    reporter_cancel: CancellationToken,
    reporter_task: JoinHandle<()>,
    // Released last.
    _pidfile: PidFile,
}

impl Agent {
    /// Start every component and block until `shutdown` is cancelled.
    pub async fn run(config: AgentConfig, shutdown: CancellationToken) -> Result<()> {
        let agent = Self::start(config, Collaborators::default()).await?;
        shutdown.cancelled().await;
        agent.stop().await
    }

    pub async fn start(config: AgentConfig, collaborators: Collaborators) -> Result<Self> {
        let pidfile = PidFile::acquire(&config.pidfile)?;
        info!(
            "monagent starting (version {}, hostname {})",
            env!("CARGO_PKG_VERSION"),
            config.hostname
        );
        for service in &config.services {
            service.validate()?;
        }

        let aggregator = Arc::new(Aggregator::new(config.aggregator_config()));

        let server = Arc::new(
            Server::bind(&config.server_config(), aggregator.clone())
                .await
                .context("starting statsd server")?,
        );
        let server_task = tokio::spawn({
            let server = server.clone();
            async move { server.start().await }
        });

        let scheduler = Arc::new(Scheduler::new(aggregator.clone(), config.scheduler_config()));
        if let Some(interval) = config.self_check_interval()
            && let Err(e) = scheduler.register(Arc::new(AgentStatsCheck::new(
                interval,
                aggregator.clone(),
                Some(server.clone()),
            )))
        {
            stop_server(&server, server_task).await;
            return Err(e.into());
        }
        let scheduler_task = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run().await }
        });

        let bridge = match (
            config.bridge_settings(),
            config.bridge_launch(server.local_addr().port()),
        ) {
            (Some(settings), Some(launch)) => {
                let supervisor = Arc::new(BridgeSupervisor::new(settings, collaborators.alerter));
                match supervisor.init(launch).await {
                    Ok(state) => {
                        info!("[bridge] initialized ({state})");
                        Some(supervisor)
                    }
                    Err(e) => {
                        stop_scheduler(&scheduler, scheduler_task).await;
                        stop_server(&server, server_task).await;
                        return Err(e).context("starting bridge");
                    }
                }
            }
            _ => None,
        };

        let reporter_cancel = CancellationToken::new();
        let reporter_task = tokio::spawn(run_reporter(
            aggregator.clone(),
            collaborators.reporter,
            config.flush_interval(),
            reporter_cancel.clone(),
        ));

        info!("monagent started");
        Ok(Self {
            aggregator,
            server,
            server_task,
            scheduler,
            scheduler_task,
            bridge,
            reporter_cancel,
            reporter_task,
            _pidfile: pidfile,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn bridge(&self) -> Option<&Arc<BridgeSupervisor>> {
        self.bridge.as_ref()
    }

    /// Stop the bridge, scheduler, server and reporter, in that order.
    pub async fn stop(self) -> Result<()> {
        info!("monagent shutting down");
        if let Some(bridge) = &self.bridge {
            bridge.stop().await;
        }

        stop_scheduler(&self.scheduler, self.scheduler_task).await;
        stop_server(&self.server, self.server_task).await;

        self.reporter_cancel.cancel();
        if let Err(e) = self.reporter_task.await {
            error!("reporter task failed: {e}");
        }

        info!("monagent stopped");
        Ok(())
    }
}

async fn stop_scheduler(scheduler: &Scheduler, task: JoinHandle<()>) {
    scheduler.shutdown();
    if let Err(e) = task.await {
        error!("scheduler task failed: {e}");
    }
}

async fn stop_server(server: &Server, task: JoinHandle<Result<()>>) {
    server.stop();
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("statsd server exited with error: {e:#}"),
        Err(e) => error!("statsd server task failed: {e}"),
    }
}
