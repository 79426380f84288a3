// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Static service-detection records consumed by external config generation.
//! The agent only validates and logs them.

use log::info;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub template_dir: PathBuf,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
    pub service_name: String,
    #[serde(default)]
    pub process_names: BTreeSet<String>,
    #[serde(default)]
    pub service_api_url: Option<String>,
    #[serde(default)]
    pub search_pattern: Option<String>,
    #[serde(default)]
    pub alarms: Vec<serde_yaml::Value>,
}

fn default_overwrite() -> bool {
    true
}

const NEUTRON_PROCESSES: &[&str] = &[
    "neutron-server",
    "neutron-openvswitch-agent",
    "neutron-rootwrap",
    "neutron-dhcp-agent",
    "neutron-vpn-agent",
    "neutron-metadata-agent",
    "neutron-metering-agent",
    "neutron-ns-metadata-proxy",
];

impl ServiceDescriptor {
    /// OpenStack Networking daemons.
    pub fn neutron(template_dir: impl Into<PathBuf>, overwrite: bool) -> Self {
        Self {
            template_dir: template_dir.into(),
            overwrite,
            service_name: "neutron".to_string(),
            process_names: NEUTRON_PROCESSES.iter().map(|s| s.to_string()).collect(),
            service_api_url: Some("http://localhost:9696".to_string()),
            search_pattern: Some(".*v2.0.*".to_string()),
            alarms: Vec::new(),
        }
    }

    /// Compile `search_pattern`, if any.
    pub fn search_regex(&self) -> Result<Option<Regex>, regex::Error> {
        self.search_pattern.as_deref().map(Regex::new).transpose()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.service_name.trim().is_empty() {
            anyhow::bail!("service descriptor has an empty service_name");
        }
        if self.process_names.is_empty() {
            anyhow::bail!("[{}] no process_names", self.service_name);
        }
        self.search_regex().map_err(|e| {
            anyhow::anyhow!("[{}] invalid search_pattern: {e}", self.service_name)
        })?;
        info!(
            "[{}] service descriptor: {} processes, api={}",
            self.service_name,
            self.process_names.len(),
            self.service_api_url.as_deref().unwrap_or("-")
        );
        Ok(())
    }
}
