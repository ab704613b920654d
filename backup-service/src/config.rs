//! Configuration management for the backup service.
//!
//! Loads configuration from a TOML file. The same structures can be built in
//! code and applied through [`crate::services::config_applier::ConfigApplier`].

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub clusters: HashMap<String, ClusterConfig>,

    #[serde(default)]
    pub storage: HashMap<String, StorageConfig>,

    #[serde(default)]
    pub backup_policies: HashMap<String, BackupPolicy>,

    #[serde(default)]
    pub backup_routines: HashMap<String, BackupRoutine>,

    #[serde(default)]
    pub secret_agents: HashMap<String, SecretAgent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Human readable identifier attached to client connections
    #[serde(default)]
    pub label: Option<String>,

    pub seed_nodes: Vec<SeedNode>,

    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Upper bound on concurrent scans issued through one client
    #[serde(default = "default_max_parallel_scans")]
    pub max_parallel_scans: usize,

    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedNode {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Where backup files live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StorageConfig {
    Local {
        path: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        path: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
    },
    AzureBlob {
        endpoint: String,
        container: String,
        #[serde(default)]
        path: String,
    },
    Gcp {
        bucket: String,
        #[serde(default)]
        path: String,
    },
}

impl StorageConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageConfig::Local { .. } => "local",
            StorageConfig::S3 { .. } => "s3",
            StorageConfig::AzureBlob { .. } => "azure-blob",
            StorageConfig::Gcp { .. } => "gcp",
        }
    }

    /// Key prefix inside the bucket/container for object stores.
    pub fn object_prefix(&self) -> Option<&str> {
        match self {
            StorageConfig::Local { .. } => None,
            StorageConfig::S3 { path, .. }
            | StorageConfig::AzureBlob { path, .. }
            | StorageConfig::Gcp { path, .. } => Some(path.trim_matches('/')),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoveFiles {
    /// Never delete anything.
    #[default]
    KeepAll,
    /// Full backups overwrite one fixed path; incrementals are cleared after each full.
    RemoveAll,
    /// Full backups are kept; incrementals are cleared after each full.
    RemoveIncremental,
}

impl RemoveFiles {
    pub fn clears_incrementals(&self) -> bool {
        !matches!(self, RemoveFiles::KeepAll)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPolicy {
    /// Retries after a failed full backup
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between full backup retries
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub remove_files: RemoveFiles,

    /// Bound record selection to records modified before the backup started
    #[serde(default)]
    pub sealed: bool,

    #[serde(default)]
    pub parallel: Option<u32>,

    #[serde(default)]
    pub no_records: bool,

    #[serde(default)]
    pub no_indexes: bool,

    #[serde(default)]
    pub no_udfs: bool,

    #[serde(default)]
    pub file_limit_mb: Option<u64>,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            remove_files: RemoveFiles::default(),
            sealed: false,
            parallel: None,
            no_records: false,
            no_indexes: false,
            no_udfs: false,
            file_limit_mb: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRoutine {
    pub backup_policy: String,
    pub source_cluster: String,
    pub storage: String,

    #[serde(default)]
    pub secret_agent: Option<String>,

    /// Full backup cron expression (seconds first)
    pub interval_cron: String,

    /// Incremental backup cron expression (seconds first)
    #[serde(default)]
    pub incr_interval_cron: Option<String>,

    /// Namespaces to back up; empty means every namespace of the cluster
    #[serde(default)]
    pub namespaces: Vec<String>,

    #[serde(default)]
    pub set_list: Vec<String>,

    #[serde(default)]
    pub bin_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretAgent {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_connection_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestorePolicy {
    #[serde(default)]
    pub parallel: Option<u32>,

    #[serde(default)]
    pub namespace: Option<RestoreNamespace>,

    #[serde(default)]
    pub set_list: Vec<String>,

    #[serde(default)]
    pub bin_list: Vec<String>,

    #[serde(default)]
    pub no_generation: bool,

    #[serde(default)]
    pub replace: bool,

    #[serde(default)]
    pub unique: bool,
}

/// Namespace remap applied during restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreNamespace {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
}

impl RestorePolicy {
    pub fn validate(&self) -> Result<()> {
        if let Some(ns) = &self.namespace {
            if ns.source.as_deref().map_or(true, str::is_empty) {
                return Err(BackupError::Config("source namespace is not specified".into()));
            }
            if ns.destination.as_deref().map_or(true, str::is_empty) {
                return Err(BackupError::Config(
                    "destination namespace is not specified".into(),
                ));
            }
        }
        if self.replace && self.unique {
            return Err(BackupError::Config(
                "replace and unique options are contradictory".into(),
            ));
        }
        Ok(())
    }
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_parallel_scans() -> usize {
    5
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    60_000
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every cross reference and schedule of the configuration.
    pub fn validate(&self) -> Result<()> {
        for (name, cluster) in &self.clusters {
            if cluster.seed_nodes.is_empty() {
                return Err(BackupError::Config(format!(
                    "cluster {name} has no seed nodes"
                )));
            }
        }

        for (name, policy) in &self.backup_policies {
            if policy.parallel == Some(0) {
                return Err(BackupError::Config(format!(
                    "policy {name}: parallel must be positive"
                )));
            }
        }

        for (name, routine) in &self.backup_routines {
            if !self.backup_policies.contains_key(&routine.backup_policy) {
                return Err(BackupError::Config(format!(
                    "routine {name}: backup policy {} not found",
                    routine.backup_policy
                )));
            }
            if !self.clusters.contains_key(&routine.source_cluster) {
                return Err(BackupError::Config(format!(
                    "routine {name}: cluster {} not found",
                    routine.source_cluster
                )));
            }
            if !self.storage.contains_key(&routine.storage) {
                return Err(BackupError::Config(format!(
                    "routine {name}: storage {} not found",
                    routine.storage
                )));
            }
            if let Some(agent) = &routine.secret_agent {
                if !self.secret_agents.contains_key(agent) {
                    return Err(BackupError::Config(format!(
                        "routine {name}: secret agent {agent} not found"
                    )));
                }
            }
            parse_cron(&routine.interval_cron).map_err(|e| {
                BackupError::Config(format!("routine {name}: interval_cron: {e}"))
            })?;
            if let Some(incr) = &routine.incr_interval_cron {
                parse_cron(incr).map_err(|e| {
                    BackupError::Config(format!("routine {name}: incr_interval_cron: {e}"))
                })?;
            }
        }

        Ok(())
    }

    /// Resolve everything a routine references. Assumes [`Config::validate`] passed.
    pub fn resolve_routine(&self, name: &str) -> Result<ResolvedRoutine> {
        let routine = self
            .backup_routines
            .get(name)
            .ok_or_else(|| BackupError::Config(format!("routine {name} not found")))?;
        let lookup = |what: &str, key: &str| BackupError::Config(format!("{what} {key} not found"));

        Ok(ResolvedRoutine {
            name: name.to_string(),
            routine: routine.clone(),
            policy: self
                .backup_policies
                .get(&routine.backup_policy)
                .cloned()
                .ok_or_else(|| lookup("backup policy", &routine.backup_policy))?,
            cluster: self
                .clusters
                .get(&routine.source_cluster)
                .cloned()
                .ok_or_else(|| lookup("cluster", &routine.source_cluster))?,
            storage: self
                .storage
                .get(&routine.storage)
                .cloned()
                .ok_or_else(|| lookup("storage", &routine.storage))?,
            secret_agent: match &routine.secret_agent {
                Some(agent) => Some(
                    self.secret_agents
                        .get(agent)
                        .cloned()
                        .ok_or_else(|| lookup("secret agent", agent))?,
                ),
                None => None,
            },
        })
    }
}

/// A routine with all of its named references looked up.
#[derive(Debug, Clone)]
pub struct ResolvedRoutine {
    pub name: String,
    pub routine: BackupRoutine,
    pub policy: BackupPolicy,
    pub cluster: ClusterConfig,
    pub storage: StorageConfig,
    pub secret_agent: Option<SecretAgent>,
}

pub fn parse_cron(expr: &str) -> std::result::Result<cron::Schedule, cron::error::Error> {
    cron::Schedule::from_str(expr)
}
