// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::{DEFAULT_CONFIG_PATH, ENV_CONFIG};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::net::UdpSocket;

/// Metrics collection agent
#[derive(Parser, Debug)]
#[command(name = "monagent", version)]
#[command(about = "Statsd ingestion, check scheduling and collector supervision")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Run the agent until SIGTERM or SIGINT
    Run {
        /// Path to the agent configuration file
        #[arg(short, long, env = ENV_CONFIG, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Send statsd lines to an agent in a single datagram
    Send {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long)]
        port: u16,

        /// Lines such as `requests:1|c|#env:prod`
        #[arg(required = true)]
        lines: Vec<String>,
    },
    /// Load and validate the configuration, then exit
    CheckConfig {
        #[arg(short, long, env = ENV_CONFIG, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

/// Join `lines` with newlines and send them as one UDP datagram.
pub async fn send_lines(host: &str, port: u16, lines: &[String]) -> Result<usize> {
    if lines.is_empty() {
        bail!("nothing to send");
    }
    let payload = lines.join("\n");
    let socket = UdpSocket::bind(("0.0.0.0", 0))
        .await
        .context("binding client socket")?;
    let sent = socket
        .send_to(payload.as_bytes(), (host, port))
        .await
        .with_context(|| format!("sending to {host}:{port}"))?;
    Ok(sent)
}
