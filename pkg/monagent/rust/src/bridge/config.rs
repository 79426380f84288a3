// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::BridgeError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BRIDGE_COMMAND: &str = "/usr/bin/jmxfetch";
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_STABLE_AFTER: Duration = Duration::from_secs(60);
pub const DEFAULT_BRIDGE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub const ENV_BRIDGE_PORT: &str = "MONAGENT_BRIDGE_PORT";
pub const ENV_BRIDGE_CONF_DIR: &str = "MONAGENT_BRIDGE_CONF_DIR";

/// One remote endpoint the bridge collects from. Serialized verbatim into
/// the bridge's per-target descriptor file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeTarget {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimensions: BTreeMap<String, String>,
}

/// Bounded exponential restart backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// A run lasting at least this long resets the attempt counter.
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            stable_after: DEFAULT_STABLE_AFTER,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub stdout: String,
    pub stderr: String,
    pub targets: Vec<BridgeTarget>,
    pub restart: RestartPolicy,
    pub stop_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            command: DEFAULT_BRIDGE_COMMAND.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            stdout: "inherit".to_string(),
            stderr: "inherit".to_string(),
            targets: Vec::new(),
            restart: RestartPolicy::default(),
            stop_timeout: DEFAULT_BRIDGE_STOP_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeLogging {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for BridgeLogging {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Per-`init` launch parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchConfig {
    pub config_dir: PathBuf,
    pub bridge_port: u16,
    pub logging: BridgeLogging,
    pub flush_interval: Duration,
}

impl LaunchConfig {
    /// Arguments appended after the configured ones.
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = vec![
            "--conf_directory".to_string(),
            self.config_dir.display().to_string(),
            "--reporter".to_string(),
            format!("statsd:{}", self.bridge_port),
            "--check_period".to_string(),
            self.flush_interval.as_millis().to_string(),
            "--log_level".to_string(),
            self.logging.level.clone(),
        ];
        if let Some(file) = &self.logging.file {
            args.push("--log_location".to_string());
            args.push(file.display().to_string());
        }
        args
    }

    pub fn launch_env(&self) -> [(&'static str, String); 2] {
        [
            (ENV_BRIDGE_PORT, self.bridge_port.to_string()),
            (ENV_BRIDGE_CONF_DIR, self.config_dir.display().to_string()),
        ]
    }
}

#[derive(Serialize)]
struct Descriptor<'a> {
    init_config: BTreeMap<String, String>,
    instances: [&'a BridgeTarget; 1],
}

/// Write one `<target>.yaml` descriptor per target into `dir` and remove
/// descriptors for targets no longer configured.
pub fn write_descriptors(dir: &Path, targets: &[BridgeTarget]) -> Result<Vec<PathBuf>, BridgeError> {
    fs::create_dir_all(dir).map_err(|source| BridgeError::Descriptors {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut written = Vec::with_capacity(targets.len());
    for target in targets {
        if target.name.is_empty() || target.name.contains(['/', '\\']) || target.name.starts_with('.') {
            return Err(BridgeError::InvalidTarget(target.name.clone()));
        }
        let path = dir.join(format!("{}.yaml", target.name));
        let body = serde_yaml::to_string(&Descriptor {
            init_config: BTreeMap::new(),
            instances: [target],
        })?;
        fs::write(&path, body).map_err(|source| BridgeError::Descriptors {
            path: path.clone(),
            source,
        })?;
        debug!("[bridge] wrote descriptor {}", path.display());
        written.push(path);
    }

    let keep: HashSet<&Path> = written.iter().map(PathBuf::as_path).collect();
    let entries = fs::read_dir(dir).map_err(|source| BridgeError::Descriptors {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_yaml = path.extension().is_some_and(|ext| ext == "yaml");
        if is_yaml && !keep.contains(path.as_path()) {
            debug!("[bridge] removing stale descriptor {}", path.display());
            fs::remove_file(&path).map_err(|source| BridgeError::Descriptors {
                path: path.clone(),
                source,
            })?;
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str, port: u16) -> BridgeTarget {
        BridgeTarget {
            name: name.to_string(),
            host: "localhost".to_string(),
            port,
            dimensions: BTreeMap::from([("service".to_string(), "solr".to_string())]),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RestartPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            stable_after: Duration::from_secs(60),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(5), Duration::from_secs(16));
        assert_eq!(policy.backoff(6), Duration::from_secs(30));
        assert_eq!(policy.backoff(100), Duration::from_secs(30));
    }

    #[test]
    fn test_allows() {
        let policy = RestartPolicy {
            max_retries: 2,
            ..RestartPolicy::default()
        };
        assert!(policy.allows(1));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn test_launch_args() {
        let launch = LaunchConfig {
            config_dir: PathBuf::from("/tmp/bridge"),
            bridge_port: 8125,
            logging: BridgeLogging {
                level: "debug".to_string(),
                file: Some(PathBuf::from("/var/log/bridge.log")),
            },
            flush_interval: Duration::from_secs(15),
        };
        assert_eq!(
            launch.launch_args(),
            vec![
                "--conf_directory",
                "/tmp/bridge",
                "--reporter",
                "statsd:8125",
                "--check_period",
                "15000",
                "--log_level",
                "debug",
                "--log_location",
                "/var/log/bridge.log",
            ]
        );
        let env = launch.launch_env();
        assert_eq!(env[0], (ENV_BRIDGE_PORT, "8125".to_string()));
    }

    #[test]
    fn test_write_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_descriptors(dir.path(), &[target("solr", 9999), target("kafka", 9998)]).unwrap();
        assert_eq!(written.len(), 2);

        let body = fs::read_to_string(dir.path().join("solr.yaml")).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&body).unwrap();
        let instance = &parsed["instances"][0];
        assert_eq!(instance["name"].as_str(), Some("solr"));
        assert_eq!(instance["host"].as_str(), Some("localhost"));
        assert_eq!(instance["port"].as_u64(), Some(9999));
        assert_eq!(instance["dimensions"]["service"].as_str(), Some("solr"));
    }

    #[test]
    fn test_write_descriptors_removes_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        write_descriptors(dir.path(), &[target("old", 1), target("kept", 2)]).unwrap();
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        write_descriptors(dir.path(), &[target("kept", 2)]).unwrap();
        assert!(!dir.path().join("old.yaml").exists());
        assert!(dir.path().join("kept.yaml").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_write_descriptors_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        write_descriptors(&nested, &[target("solr", 9999)]).unwrap();
        assert!(nested.join("solr.yaml").exists());
    }

    #[test]
    fn test_write_descriptors_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_descriptors(dir.path(), &[target("../escape", 1)]).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidTarget(_)));
    }
}
