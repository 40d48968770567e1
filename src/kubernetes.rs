// SPDX-License-Identifier: Apache-2.0

//! Kubernetes source handling: kubelet log-file identity parsing and the
//! label-based exclusion filter.
//!
//! The kubelet symlinks one log file per container under
//! `/var/log/containers/`, named `PODNAME_NAMESPACE_CONTAINERNAME.log`.
//! That identity is enough to build the per-file metadata envelope and to
//! apply the configured exclusion rules; pod labels and the root owner
//! arrive later from an external collaborator, at which point the filter is
//! re-applied and a matching source gets its stop signal.

use std::path::Path;

use regex::Regex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::metadata::KubernetesContext;

/// Where the kubelet keeps per-container log files.
pub const DEFAULT_LOG_GLOB: &str = "/var/log/containers/*.log";

/// Parse the pod/namespace/container identity out of a kubelet log path.
pub fn parse_log_file(path: &Path) -> Result<KubernetesContext> {
    let file_name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default();

    let parts: Vec<&str> = file_name.split('_').collect();
    if parts.len() != 3 {
        return Err(Error::Config(format!(
            "unable to parse Kubernetes log file name: {}",
            path.display()
        )));
    }

    Ok(KubernetesContext {
        pod_name: Some(parts[0].to_string()),
        namespace: Some(parts[1].to_string()),
        container_name: Some(parts[2].to_string()),
        root_owner: None,
        labels: None,
    })
}

/// Compiled `[kubernetes.exclude]` rules. Each kind holds a list of regular
/// expressions parsed from the comma-separated config value.
#[derive(Debug, Default)]
pub struct ExcludeRules {
    namespaces: Vec<Regex>,
    deployments: Vec<Regex>,
    pods: Vec<Regex>,
}

impl ExcludeRules {
    pub fn new(
        namespaces: Option<&str>,
        deployments: Option<&str>,
        pods: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            namespaces: compile_list(namespaces)?,
            deployments: compile_list(deployments)?,
            pods: compile_list(pods)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty() && self.deployments.is_empty() && self.pods.is_empty()
    }

    /// Evaluate the rules against a context. Returns the matching filter as
    /// `kind:pattern` when the source should be excluded.
    pub fn apply_filter(&self, context: &KubernetesContext) -> Option<String> {
        if let Some(pod_name) = &context.pod_name {
            for pattern in &self.pods {
                if pattern.is_match(pod_name) {
                    return Some(format!("pods:{}", pattern.as_str()));
                }
            }
        }

        if let Some(namespace) = &context.namespace {
            for pattern in &self.namespaces {
                if pattern.is_match(namespace) {
                    return Some(format!("namespaces:{}", pattern.as_str()));
                }
            }
        }

        // Deployment rules only apply once the root owner is known and is
        // actually a Deployment.
        if let Some(owner) = &context.root_owner {
            if owner.get("kind").map(String::as_str) == Some("Deployment") {
                if let Some(name) = owner.get("name") {
                    for pattern in &self.deployments {
                        if pattern.is_match(name) {
                            return Some(format!("deployments:{}", pattern.as_str()));
                        }
                    }
                }
            }
        }

        None
    }
}

fn compile_list(value: Option<&str>) -> Result<Vec<Regex>> {
    let mut patterns = Vec::new();
    let Some(value) = value else {
        return Ok(patterns);
    };

    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match Regex::new(part) {
            Ok(regex) => patterns.push(regex),
            Err(e) => {
                warn!(pattern = part, error = %e, "Skipping invalid exclusion pattern");
            }
        }
    }

    Ok(patterns)
}
