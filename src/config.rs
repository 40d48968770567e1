// SPDX-License-Identifier: Apache-2.0

//! TOML configuration, normalized into a validated [`AgentConfig`] at
//! startup so downstream stages only see the fields they need.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default configuration location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/timber.toml";

/// Default ingestion endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://logs.timber.io/frames";

const DEFAULT_BATCH_PERIOD_SECONDS: u64 = 3;

/// Raw deserialized shape of the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    default_api_key: Option<String>,
    endpoint: Option<String>,
    batch_period_seconds: Option<u64>,
    poll: Option<bool>,
    hostname: Option<String>,
    disable_ec2_metadata: Option<bool>,
    read_from_start: Option<bool>,
    files: Vec<FileEntry>,
    kubernetes: Option<KubernetesSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileEntry {
    path: String,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct KubernetesSection {
    exclude: Option<ExcludeSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ExcludeSection {
    namespaces: Option<String>,
    deployments: Option<String>,
    pods: Option<String>,
}

/// One `[[files]]` entry with its credential resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSourceConfig {
    /// Glob pattern (a plain path is a pattern matching itself).
    pub path: String,
    pub api_key: String,
}

/// Comma-separated regex lists from `[kubernetes.exclude]`, kept raw here
/// and compiled where they are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubernetesExcludeConfig {
    pub namespaces: Option<String>,
    pub deployments: Option<String>,
    pub pods: Option<String>,
}

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub default_api_key: Option<String>,
    pub endpoint: String,
    pub batch_period: Duration,
    pub poll: bool,
    pub hostname: Option<String>,
    pub disable_ec2_metadata: bool,
    pub read_from_start: bool,
    pub files: Vec<FileSourceConfig>,
    pub kubernetes_exclude: KubernetesExcludeConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            batch_period: Duration::from_secs(DEFAULT_BATCH_PERIOD_SECONDS),
            poll: false,
            hostname: None,
            disable_ec2_metadata: false,
            read_from_start: false,
            files: Vec::new(),
            kubernetes_exclude: KubernetesExcludeConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Read and validate the config file. A missing file yields the
    /// defaults when `required` is false; every other failure is fatal.
    pub fn load(path: impl AsRef<Path>, required: bool) -> Result<Self> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::Config(format!(
                    "unable to read config file {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let file: ConfigFile = toml::from_str(&contents).map_err(|e| {
            Error::Config(format!("unable to parse config file {}: {}", path.display(), e))
        })?;

        Self::from_file(file)
    }

    fn from_file(file: ConfigFile) -> Result<Self> {
        let batch_period_seconds = match file.batch_period_seconds {
            Some(0) | None => DEFAULT_BATCH_PERIOD_SECONDS,
            Some(seconds) => seconds,
        };

        let mut files = Vec::with_capacity(file.files.len());
        for entry in file.files {
            let api_key = entry
                .api_key
                .or_else(|| file.default_api_key.clone())
                .ok_or_else(|| {
                    Error::Config(format!(
                        "file {} has no api_key and no default_api_key is set",
                        entry.path
                    ))
                })?;
            files.push(FileSourceConfig {
                path: entry.path,
                api_key,
            });
        }

        let kubernetes_exclude = file
            .kubernetes
            .and_then(|k| k.exclude)
            .map(|e| KubernetesExcludeConfig {
                namespaces: e.namespaces,
                deployments: e.deployments,
                pods: e.pods,
            })
            .unwrap_or_default();

        Ok(Self {
            default_api_key: file.default_api_key,
            endpoint: file.endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            batch_period: Duration::from_secs(batch_period_seconds),
            poll: file.poll.unwrap_or(false),
            hostname: file.hostname,
            disable_ec2_metadata: file.disable_ec2_metadata.unwrap_or(false),
            read_from_start: file.read_from_start.unwrap_or(false),
            files,
            kubernetes_exclude,
        })
    }
}
