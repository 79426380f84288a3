// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, info};
use monagent::cli::{Cli, Command, send_lines};
use monagent::{Agent, AgentConfig};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => {
            let config = AgentConfig::load(&config)?;
            let level = agent_log::parse_level(&config.log.level).unwrap_or(LevelFilter::Info);
            agent_log::init("monagent", level, config.log.file.as_deref())
                .context("initializing logging")?;

            let shutdown = CancellationToken::new();
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let mut agent = tokio::spawn(Agent::run(config, shutdown.clone()));

            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
                // Startup failure.
                res = &mut agent => return res.context("agent task failed")?,
            }
            shutdown.cancel();
            agent.await.context("agent task failed")?
        }
        Command::Send { host, port, lines } => {
            let sent = send_lines(&host, port, &lines).await?;
            println!("sent {sent} bytes to {host}:{port}");
            Ok(())
        }
        Command::CheckConfig { config: path } => {
            let config = AgentConfig::load(&path)?;
            println!(
                "{}: ok (hostname={}, statsd={}:{}, bridge={}, services={})",
                path.display(),
                config.hostname,
                config.statsd.host,
                config.statsd.port,
                if config.bridge.is_some() { "enabled" } else { "disabled" },
                config.services.len()
            );
            Ok(())
        }
    }
}
