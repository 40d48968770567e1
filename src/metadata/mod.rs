// SPDX-License-Identifier: Apache-2.0

//! The metadata envelope attached to every outgoing batch.
//!
//! One base envelope is built at startup (hostname, EC2 platform data).
//! Per-source envelopes are derived by deep copy so that setting the source
//! filename can never race another pipeline, then serialized once and handed
//! to the forwarder as opaque bytes.

pub mod ec2;

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Published schema for the envelope.
const SCHEMA_URL: &str =
    "https://raw.githubusercontent.com/timberio/log-event-json-schema/v4.1.0/schema.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(rename = "$schema")]
    pub schema: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws_ec2: Option<AwsEc2Context>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwsEc2Context {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ami_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_hostname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubernetesContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_owner: Option<std::collections::HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<std::collections::HashMap<String, String>>,
}

impl Default for LogEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl LogEvent {
    pub fn new() -> Self {
        Self {
            schema: SCHEMA_URL.to_string(),
            context: None,
        }
    }

    pub fn encode_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.ensure_system_context().hostname = Some(hostname.into());
    }

    pub fn add_ec2_context(&mut self, context: AwsEc2Context) {
        self.ensure_platform_context().aws_ec2 = Some(context);
    }

    pub fn add_kubernetes_context(&mut self, context: KubernetesContext) {
        self.ensure_platform_context().kubernetes = Some(context);
    }

    /// Derive the envelope for a file source: a deep copy with the source
    /// filename set, leaving the shared base untouched.
    pub fn for_source_file(&self, path: &Path) -> LogEvent {
        let mut event = self.clone();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        event.ensure_source_context().file_name = Some(file_name);
        event
    }

    fn ensure_context(&mut self) -> &mut Context {
        self.context.get_or_insert_with(Context::default)
    }

    fn ensure_system_context(&mut self) -> &mut SystemContext {
        self.ensure_context()
            .system
            .get_or_insert_with(SystemContext::default)
    }

    fn ensure_platform_context(&mut self) -> &mut PlatformContext {
        self.ensure_context()
            .platform
            .get_or_insert_with(PlatformContext::default)
    }

    fn ensure_source_context(&mut self) -> &mut SourceContext {
        self.ensure_context()
            .source
            .get_or_insert_with(SourceContext::default)
    }
}

/// Build the shared base envelope: hostname from the config override or the
/// operating system, and EC2 platform metadata unless disabled. Best-effort
/// throughout; a probe failure leaves the envelope usable.
pub async fn build_base_metadata(hostname_override: Option<&str>, disable_ec2: bool) -> LogEvent {
    let mut event = LogEvent::new();

    match hostname_override {
        Some(hostname) => event.set_hostname(hostname),
        None => match gethostname::gethostname().into_string() {
            Ok(hostname) => event.set_hostname(hostname),
            Err(_) => warn!("Could not autodiscover hostname from operating system"),
        },
    }

    if !disable_ec2 {
        let client = ec2::Ec2MetadataClient::new();
        ec2::add_ec2_metadata(&client, &mut event).await;
    }

    event
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_envelope_serializes_to_schema_only() {
        let event = LogEvent::new();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["$schema"].as_str().unwrap(), SCHEMA_URL);
        assert!(json.get("context").is_none());
    }

    #[test]
    fn hostname_lands_in_system_context() {
        let mut event = LogEvent::new();
        event.set_hostname("web-1");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["context"]["system"]["hostname"], "web-1");
        assert!(json["context"].get("platform").is_none());
    }

    #[test]
    fn per_source_copy_does_not_mutate_the_base() {
        let mut base = LogEvent::new();
        base.set_hostname("web-1");

        let derived = base.for_source_file(Path::new("/var/log/apache2/access.log"));

        let file_name = derived
            .context
            .as_ref()
            .unwrap()
            .source
            .as_ref()
            .unwrap()
            .file_name
            .clone();
        assert_eq!(file_name.unwrap(), "access.log");

        // The shared base has no source context.
        assert!(base.context.unwrap().source.is_none());
    }

    #[test]
    fn ec2_context_round_trips() {
        let mut event = LogEvent::new();
        event.add_ec2_context(AwsEc2Context {
            ami_id: Some("ami-12345".into()),
            instance_id: Some("i-67890".into()),
            ..Default::default()
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["context"]["platform"]["aws_ec2"]["ami_id"], "ami-12345");
        assert_eq!(
            json["context"]["platform"]["aws_ec2"]["instance_id"],
            "i-67890"
        );
        // Fields that failed to resolve are omitted entirely.
        assert!(json["context"]["platform"]["aws_ec2"]
            .get("public_hostname")
            .is_none());
    }
}
