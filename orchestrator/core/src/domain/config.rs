// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Fleet Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) for the
// task-distribution layer of an orchestrator process:
// - Sparse index spacing, grace period and background indexer pacing
// - Lease queue defaults and the poison-record policy
// - Worker loop queues, leases and parallelism
// - Logging settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "FleetConfig";

/// Top-level fleet configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfigManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "FleetConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: FleetConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfigSpec {
    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Sparse index and background indexer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Records between two index samples
    #[serde(default = "default_index_spacing")]
    pub spacing: u64,

    /// Records younger than this are never indexed
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,

    /// Pause between two index writes of the background indexer
    #[serde(default = "default_index_write_delay", with = "humantime_serde")]
    pub write_delay: Duration,

    /// How often the background indexer wakes up
    #[serde(default = "default_index_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Minimum age of a registration before the indexer acts on it
    #[serde(default = "default_registration_delay", with = "humantime_serde")]
    pub registration_delay: Duration,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Lease queue defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_lease", with = "humantime_serde")]
    pub default_lease: Duration,

    /// Default cap on records returned by one claim
    #[serde(default = "default_claim_limit")]
    pub claim_limit: usize,

    /// Stop a claim scan after this many filtered-out records
    #[serde(default = "default_max_filtered")]
    pub max_filtered: usize,

    /// Cells per store round trip while scanning
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    #[serde(default)]
    pub poison: PoisonPolicy,
}

/// What to do with records that keep coming back.
///
/// Claims are counted per record. Crossing `warn_after_claims` logs a
/// warning on every further claim; `max_claims`, when set, parks the record:
/// it stays in the log but is no longer handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoisonPolicy {
    #[serde(default = "default_warn_after_claims")]
    pub warn_after_claims: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_claims: Option<u32>,
}

/// Worker loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Work queues this worker drains (session id prefixes)
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    /// Stable worker identity for logs; generated when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    #[serde(default = "default_worker_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Lease taken on a flow's task record while executing it
    #[serde(default = "default_flow_lease", with = "humantime_serde")]
    pub flow_lease: Duration,

    /// Lease taken on notifications while their session is processed
    #[serde(default = "default_notification_lease", with = "humantime_serde")]
    pub notification_lease: Duration,

    /// Maximum notifications claimed per cycle
    #[serde(default = "default_notification_batch")]
    pub notification_batch: usize,

    /// Sessions executed concurrently per worker process
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "compact" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_true() -> bool {
    true
}

fn default_index_spacing() -> u64 {
    1024
}

fn default_grace_period() -> Duration {
    Duration::from_secs(180)
}

fn default_index_write_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_index_poll_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_registration_delay() -> Duration {
    Duration::from_secs(240)
}

fn default_lease() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_claim_limit() -> usize {
    10_000
}

fn default_max_filtered() -> usize {
    1000
}

fn default_page_size() -> usize {
    1000
}

fn default_warn_after_claims() -> u32 {
    10
}

fn default_queues() -> Vec<String> {
    vec!["flows".to_string()]
}

fn default_worker_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_flow_lease() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_notification_lease() -> Duration {
    Duration::from_secs(60)
}

fn default_notification_batch() -> usize {
    100
}

fn default_parallelism() -> usize {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            spacing: default_index_spacing(),
            grace_period: default_grace_period(),
            write_delay: default_index_write_delay(),
            poll_interval: default_index_poll_interval(),
            registration_delay: default_registration_delay(),
            enabled: true,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_lease: default_lease(),
            claim_limit: default_claim_limit(),
            max_filtered: default_max_filtered(),
            page_size: default_page_size(),
            poison: PoisonPolicy::default(),
        }
    }
}

impl Default for PoisonPolicy {
    fn default() -> Self {
        Self {
            warn_after_claims: default_warn_after_claims(),
            max_claims: None,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            worker_id: None,
            poll_interval: default_worker_poll_interval(),
            flow_lease: default_flow_lease(),
            notification_lease: default_notification_lease(),
            notification_batch: default_notification_batch(),
            parallelism: default_parallelism(),
            enabled: true,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for FleetConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "aegis-fleet".to_string(),
                labels: None,
            },
            spec: FleetConfigSpec::default(),
        }
    }
}

impl FleetConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order
    /// 1. AEGIS_FLEET_CONFIG environment variable
    /// 2. ./aegis-fleet.yaml (working directory)
    /// 3. /etc/aegis/fleet.yaml (system, Unix)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("AEGIS_FLEET_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./aegis-fleet.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        #[cfg(unix)]
        {
            let system_config = PathBuf::from("/etc/aegis/fleet.yaml");
            if system_config.exists() {
                return Some(system_config);
            }
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(explicit_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = explicit_path {
            tracing::info!("Loading fleet configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load fleet config at {:?}: {}", path, e)
            })?
        } else if let Some(path) = Self::discover_config() {
            tracing::info!("Loading fleet configuration from discovered path: {:?}", path);
            Self::from_yaml_file(path)?
        } else {
            tracing::warn!("No fleet configuration file found. Using defaults.");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("AEGIS_FLEET_WORKER_PARALLELISM") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => {
                    tracing::info!("Environment override: AEGIS_FLEET_WORKER_PARALLELISM={}", n);
                    self.spec.worker.parallelism = n;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for AEGIS_FLEET_WORKER_PARALLELISM: '{}'. Expected a positive integer. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("AEGIS_FLEET_WORKER_ID") {
            if !val.is_empty() {
                self.spec.worker.worker_id = Some(val);
            }
        }

        if let Ok(val) = std::env::var("AEGIS_FLEET_LOG_LEVEL") {
            self.spec.observability.log_level = val;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.index.spacing == 0 {
            anyhow::bail!("spec.index.spacing must be at least 1");
        }

        if spec.queue.default_lease.is_zero() {
            anyhow::bail!("spec.queue.default_lease must be positive");
        }

        if let Some(max) = spec.queue.poison.max_claims {
            if max == 0 {
                anyhow::bail!("spec.queue.poison.max_claims must be at least 1 when set");
            }
        }

        if spec.worker.queues.is_empty() {
            anyhow::bail!("spec.worker.queues cannot be empty");
        }

        for queue in &spec.worker.queues {
            if queue.is_empty() || queue.contains(':') || queue.contains('/') {
                anyhow::bail!("Invalid worker queue name: '{}'", queue);
            }
        }

        if spec.worker.parallelism == 0 {
            anyhow::bail!("spec.worker.parallelism must be at least 1");
        }

        if spec.worker.flow_lease.is_zero() || spec.worker.notification_lease.is_zero() {
            anyhow::bail!("spec.worker leases must be positive");
        }

        match spec.observability.log_format.as_str() {
            "compact" | "json" => {}
            other => anyhow::bail!("Invalid log_format: '{}'. Expected compact or json", other),
        }

        Ok(())
    }
}
