// SPDX-License-Identifier: Apache-2.0

//! EC2 instance-metadata probing.
//!
//! The well-known metadata endpoint either answers within the 1-second
//! timeout (we are on EC2) or it does not (we are not, or the instance
//! blocks it). Every field is fetched individually and best-effort.

use std::time::Duration;

use bytes::Bytes;
use http::Method;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tower::BoxError;
use tracing::{info, warn};

use crate::metadata::{AwsEc2Context, LogEvent};

const DEFAULT_BASE_ENDPOINT: &str = "http://169.254.169.254";
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Ec2MetadataClient {
    base_endpoint: String,
    client: HyperClient<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl Default for Ec2MetadataClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Ec2MetadataClient {
    pub fn new() -> Self {
        Self::with_base_endpoint(DEFAULT_BASE_ENDPOINT)
    }

    /// Point the probe at an alternate endpoint. Tests use this.
    pub fn with_base_endpoint(base_endpoint: impl Into<String>) -> Self {
        let client = HyperClient::builder(TokioExecutor::new())
            .timer(TokioTimer::new())
            .build::<_, Full<Bytes>>(HttpConnector::new());

        Self {
            base_endpoint: base_endpoint.into(),
            client,
            timeout: PROBE_TIMEOUT,
        }
    }

    /// Whether the metadata endpoint is reachable at all.
    pub async fn available(&self) -> bool {
        matches!(self.get("/latest/meta-data/").await, Ok(_))
    }

    /// Fetch a single metadata field.
    pub async fn get_metadata(&self, field: &str) -> Result<String, BoxError> {
        self.get(&format!("/latest/meta-data/{}", field)).await
    }

    async fn get(&self, path: &str) -> Result<String, BoxError> {
        let uri = format!("{}{}", self.base_endpoint, path);
        let request = http::Request::builder()
            .method(Method::GET)
            .uri(uri.as_str())
            .body(Full::new(Bytes::new()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| -> BoxError { "metadata request timed out".into() })??;

        if !response.status().is_success() {
            return Err(format!(
                "did not receive a valid response for EC2 metadata (status code {})",
                response.status().as_u16()
            )
            .into());
        }

        let body = response.into_body().collect().await?.to_bytes();
        Ok(String::from_utf8_lossy(&body).to_string())
    }
}

/// Probe the metadata service and attach whatever resolves to the envelope.
pub async fn add_ec2_metadata(client: &Ec2MetadataClient, event: &mut LogEvent) {
    if !client.available().await {
        info!("Agent is not running on an EC2 instance");
        return;
    }
    info!("Agent is running on an EC2 instance");

    let mut context = AwsEc2Context::default();

    match client.get_metadata("ami-id").await {
        Ok(value) => {
            info!(ami_id = %value, "Discovered AMI ID from EC2 metadata");
            context.ami_id = Some(value);
        }
        Err(_) => warn!("Could not determine the AMI ID the EC2 instance was launched with"),
    }

    match client.get_metadata("hostname").await {
        Ok(value) => {
            info!(hostname = %value, "Discovered hostname from EC2 metadata");
            context.hostname = Some(value);
        }
        Err(_) => warn!("Could not determine the AWS assigned hostname for the EC2 instance"),
    }

    match client.get_metadata("instance-id").await {
        Ok(value) => {
            info!(instance_id = %value, "Discovered instance ID from EC2 metadata");
            context.instance_id = Some(value);
        }
        Err(_) => warn!("Could not determine the instance ID for the EC2 instance"),
    }

    match client.get_metadata("instance-type").await {
        Ok(value) => {
            info!(instance_type = %value, "Discovered instance type from EC2 metadata");
            context.instance_type = Some(value);
        }
        Err(_) => warn!("Could not determine the instance type for the EC2 instance"),
    }

    match client.get_metadata("public-hostname").await {
        Ok(value) => {
            info!(public_hostname = %value, "Discovered public hostname from EC2 metadata");
            context.public_hostname = Some(value);
        }
        Err(_) => {
            warn!("Could not determine the AWS assigned public hostname for the EC2 instance")
        }
    }

    event.add_ec2_context(context);
}
