// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::aggregator::{
    AggregatorConfig, DEFAULT_HISTOGRAM_BUFFER_SIZE, DEFAULT_PERCENTILES, percentile_suffix,
};
use crate::bridge::{BridgeLogging, BridgeSettings, BridgeTarget, LaunchConfig, RestartPolicy};
use crate::bridge::config::{
    DEFAULT_BRIDGE_COMMAND, DEFAULT_BRIDGE_STOP_TIMEOUT, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF,
    DEFAULT_MAX_RETRIES, DEFAULT_STABLE_AFTER,
};
use crate::scheduler::{
    DEFAULT_MAX_CONCURRENT_CHECKS, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_TICK, SchedulerConfig,
};
use crate::server::{DEFAULT_BUFFER_SIZE, DEFAULT_STATSD_PORT, ServerConfig};
use crate::services::ServiceDescriptor;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/monagent/agent.yaml";
pub const ENV_CONFIG: &str = "MONAGENT_CONFIG";
pub const ENV_LOG_LEVEL: &str = "MONAGENT_LOG_LEVEL";

fn default_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_flush_interval_secs() -> u64 {
    15
}

fn default_pidfile() -> PathBuf {
    PathBuf::from("/var/run/monagent/monagent.pid")
}

fn default_self_check_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_statsd_host() -> String {
    "127.0.0.1".to_string()
}

fn default_statsd_port() -> u16 {
    DEFAULT_STATSD_PORT
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_percentiles() -> Vec<f64> {
    DEFAULT_PERCENTILES.to_vec()
}

fn default_histogram_buffer_size() -> usize {
    DEFAULT_HISTOGRAM_BUFFER_SIZE
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK.as_millis() as u64
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_CHECKS
}

fn default_shutdown_timeout_secs() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT.as_secs()
}

fn default_bridge_command() -> String {
    DEFAULT_BRIDGE_COMMAND.to_string()
}

fn default_bridge_config_dir() -> PathBuf {
    PathBuf::from("/etc/monagent/bridge.d")
}

fn default_inherit() -> String {
    "inherit".to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF.as_millis() as u64
}

fn default_max_backoff_secs() -> u64 {
    DEFAULT_MAX_BACKOFF.as_secs()
}

fn default_stable_after_secs() -> u64 {
    DEFAULT_STABLE_AFTER.as_secs()
}

fn default_bridge_stop_timeout_secs() -> u64 {
    DEFAULT_BRIDGE_STOP_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_pidfile")]
    pub pidfile: PathBuf,
    /// 0 disables the built-in agent stats check.
    #[serde(default = "default_self_check_interval_secs")]
    pub self_check_interval_secs: u64,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub statsd: StatsdConfig,
    #[serde(default)]
    pub aggregator: AggregatorSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// The bridge is launched only when this section is present.
    #[serde(default)]
    pub bridge: Option<BridgeConfig>,
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsdConfig {
    #[serde(default = "default_statsd_host")]
    pub host: String,
    #[serde(default = "default_statsd_port")]
    pub port: u16,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for StatsdConfig {
    fn default() -> Self {
        Self {
            host: default_statsd_host(),
            port: default_statsd_port(),
            buffer_size: default_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregatorSection {
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<f64>,
    #[serde(default = "default_histogram_buffer_size")]
    pub histogram_buffer_size: usize,
}

impl Default for AggregatorSection {
    fn default() -> Self {
        Self {
            percentiles: default_percentiles(),
            histogram_buffer_size: default_histogram_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            max_concurrent: default_max_concurrent(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_inherit")]
    pub stdout: String,
    #[serde(default = "default_inherit")]
    pub stderr: String,
    #[serde(default = "default_bridge_config_dir")]
    pub config_dir: PathBuf,
    /// Defaults to the agent's own log level.
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: u64,
    #[serde(default = "default_bridge_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default)]
    pub targets: Vec<BridgeTarget>,
}

impl AgentConfig {
    /// Read and validate the YAML file at `path`, then apply environment
    /// overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config = Self::from_yaml(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        // An empty file means all defaults.
        if contents.trim().is_empty() {
            return Ok(serde_yaml::from_str("{}")?);
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|l| !l.trim().is_empty()) {
            self.log.level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            bail!("hostname must not be empty");
        }
        if self.flush_interval_secs == 0 {
            bail!("flush_interval_secs must be greater than 0");
        }
        if agent_log::parse_level(&self.log.level).is_none() {
            bail!("unknown log level {:?}", self.log.level);
        }
        if let Some(p) = self
            .aggregator
            .percentiles
            .iter()
            .find(|p| !(**p > 0.0 && **p <= 1.0))
        {
            bail!("aggregator percentile {p} is outside (0, 1]");
        }
        let mut suffixes = HashMap::new();
        for p in &self.aggregator.percentiles {
            let suffix = percentile_suffix(*p);
            if let Some(prev) = suffixes.insert(suffix.clone(), *p)
                && prev != *p
            {
                bail!("aggregator percentiles {prev} and {p} both report as {suffix}");
            }
        }
        if self.aggregator.histogram_buffer_size == 0 {
            bail!("aggregator.histogram_buffer_size must be greater than 0");
        }
        if self.scheduler.tick_ms == 0 || self.scheduler.max_concurrent == 0 {
            bail!("scheduler.tick_ms and scheduler.max_concurrent must be greater than 0");
        }
        if let Some(bridge) = &self.bridge {
            if bridge.command.trim().is_empty() {
                bail!("bridge.command must not be empty");
            }
            if let Some(level) = &bridge.log_level
                && agent_log::parse_level(level).is_none()
            {
                bail!("unknown bridge log level {level:?}");
            }
        }
        for service in &self.services {
            service.validate()?;
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn self_check_interval(&self) -> Option<Duration> {
        (self.self_check_interval_secs > 0).then(|| Duration::from_secs(self.self_check_interval_secs))
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            hostname: self.hostname.clone(),
            percentiles: self.aggregator.percentiles.clone(),
            histogram_buffer_size: self.aggregator.histogram_buffer_size,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.statsd.host.clone(),
            port: self.statsd.port,
            buffer_size: self.statsd.buffer_size,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(self.scheduler.tick_ms),
            max_concurrent: self.scheduler.max_concurrent,
            shutdown_timeout: Duration::from_secs(self.scheduler.shutdown_timeout_secs),
        }
    }

    pub fn bridge_settings(&self) -> Option<BridgeSettings> {
        let bridge = self.bridge.as_ref()?;
        Some(BridgeSettings {
            command: bridge.command.clone(),
            args: bridge.args.clone(),
            env: bridge.env.clone(),
            working_dir: bridge.working_dir.clone(),
            stdout: bridge.stdout.clone(),
            stderr: bridge.stderr.clone(),
            targets: bridge.targets.clone(),
            restart: RestartPolicy {
                max_retries: bridge.max_retries,
                initial_backoff: Duration::from_millis(bridge.initial_backoff_ms),
                max_backoff: Duration::from_secs(bridge.max_backoff_secs),
                stable_after: Duration::from_secs(bridge.stable_after_secs),
            },
            stop_timeout: Duration::from_secs(bridge.stop_timeout_secs),
        })
    }

    /// Launch parameters for a bridge reporting to the statsd port actually bound.
    pub fn bridge_launch(&self, bridge_port: u16) -> Option<LaunchConfig> {
        let bridge = self.bridge.as_ref()?;
        Some(LaunchConfig {
            config_dir: bridge.config_dir.clone(),
            bridge_port,
            logging: BridgeLogging {
                level: bridge
                    .log_level
                    .clone()
                    .unwrap_or_else(|| self.log.level.clone()),
                file: bridge.log_file.clone(),
            },
            flush_interval: self.flush_interval(),
        })
    }
}
