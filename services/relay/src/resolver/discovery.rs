//! Service discovery registry strategy.
//!
//! Queries the Cloud Map `DiscoverInstances` data API for
//! `pr-<id>-service` in the configured namespace, asking for healthy
//! instances only. The first instance with a usable address wins.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::credentials::{CredentialProvider, CredentialSource};
use super::sigv4::{self, SigningRequest};
use super::{Resolver, Target};
use crate::error::ResolveError;
use crate::relay::EnvironmentId;

const SIGNING_SERVICE: &str = "servicediscovery";
const TARGET_HEADER: &str = "x-amz-target";
const DISCOVER_INSTANCES: &str = "Route53AutoNaming_v20170314.DiscoverInstances";
const AMZ_JSON: &str = "application/x-amz-json-1.1";

/// Instances requested per query; only the first usable one is kept.
const MAX_RESULTS: u32 = 10;

const ATTR_IPV4: &str = "AWS_INSTANCE_IPV4";
const ATTR_IPV6: &str = "AWS_INSTANCE_IPV6";
const ATTR_PORT: &str = "AWS_INSTANCE_PORT";

/// Registry resolver settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Data API endpoint. Defaults to the regional AWS endpoint.
    pub endpoint: Option<String>,
    pub region: String,
    pub namespace: String,
    /// Port used when an instance does not advertise one.
    pub default_port: u16,
    /// Requests are unsigned when absent (local registries, emulators).
    pub credentials: Option<CredentialSource>,
    pub request_timeout: Duration,
}

impl DiscoveryConfig {
    fn endpoint(&self) -> String {
        self.endpoint.clone().unwrap_or_else(|| {
            format!("https://data-servicediscovery.{}.amazonaws.com/", self.region)
        })
    }

    /// True when requests would reach the AWS endpoint without a signature.
    /// AWS rejects those, so every resolution would fail.
    pub fn unsigned_aws_endpoint(&self) -> bool {
        self.credentials.is_none() && self.endpoint.is_none()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DiscoverInstancesRequest<'a> {
    namespace_name: &'a str,
    service_name: &'a str,
    health_status: &'static str,
    max_results: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiscoverInstancesResponse {
    #[serde(default)]
    instances: Vec<InstanceSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceSummary {
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    health_status: Option<String>,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

impl InstanceSummary {
    fn is_healthy(&self) -> bool {
        !matches!(self.health_status.as_deref(), Some("UNHEALTHY"))
    }

    fn target(&self, default_port: u16) -> Option<Target> {
        let host: IpAddr = self
            .attributes
            .get(ATTR_IPV4)
            .or_else(|| self.attributes.get(ATTR_IPV6))
            .and_then(|raw| raw.trim().parse().ok())?;

        let port = self
            .attributes
            .get(ATTR_PORT)
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(default_port);

        Some(Target::new(host, port))
    }
}

/// Resolver backed by the service discovery registry.
pub struct DiscoveryResolver {
    client: reqwest::Client,
    url: Url,
    /// `host[:port]` as sent in the Host header, needed for signing.
    host: String,
    credentials: Option<CredentialProvider>,
    config: DiscoveryConfig,
}

impl DiscoveryResolver {
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        let endpoint = config.endpoint();
        let url = Url::parse(&endpoint)
            .with_context(|| format!("Invalid discovery endpoint {endpoint}"))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => anyhow::bail!("Discovery endpoint {endpoint} has no host"),
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(AMZ_JSON));
        headers.insert(TARGET_HEADER, HeaderValue::from_static(DISCOVER_INSTANCES));

        let client = reqwest::Client::builder()
            .user_agent("preview-relay/0.1.0")
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build discovery HTTP client")?;

        let credentials = config
            .credentials
            .clone()
            .map(|source| CredentialProvider::new(source, config.request_timeout))
            .transpose()?;

        info!(
            endpoint = %url,
            region = %config.region,
            namespace = %config.namespace,
            credentials = config.credentials.as_ref().map_or("none", CredentialSource::kind),
            "Discovery resolver configured"
        );
        if config.unsigned_aws_endpoint() {
            warn!(
                endpoint = %url,
                "No AWS credentials found; registry queries will be unsigned and rejected"
            );
        }

        Ok(Self {
            client,
            url,
            host,
            credentials,
            config,
        })
    }

    async fn discover(&self, service: &str) -> Result<Vec<InstanceSummary>, ResolveError> {
        let body = serde_json::to_vec(&DiscoverInstancesRequest {
            namespace_name: &self.config.namespace,
            service_name: service,
            health_status: "HEALTHY",
            max_results: MAX_RESULTS,
        })
        .map_err(|e| lookup_error(service, e))?;

        let mut request = self.client.post(self.url.clone());
        if let Some(provider) = &self.credentials {
            let credentials = provider
                .credentials()
                .await
                .map_err(|e| lookup_error(service, e))?;
            let signed = sigv4::sign(
                &credentials,
                &SigningRequest {
                    host: &self.host,
                    region: &self.config.region,
                    service: SIGNING_SERVICE,
                    headers: &[("content-type", AMZ_JSON), (TARGET_HEADER, DISCOVER_INSTANCES)],
                    payload: &body,
                },
                Utc::now(),
            );
            for (name, value) in signed {
                request = request.header(name, value);
            }
        }

        let resp = request
            .body(body)
            .send()
            .await
            .map_err(|e| lookup_error(service, e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ResolveError::Registry {
                service: service.to_string(),
                status,
                body,
            });
        }

        let parsed: DiscoverInstancesResponse =
            resp.json().await.map_err(|e| lookup_error(service, e))?;
        Ok(parsed.instances)
    }
}

fn lookup_error(service: &str, err: impl std::fmt::Display) -> ResolveError {
    ResolveError::Lookup {
        name: service.to_string(),
        detail: err.to_string(),
    }
}

#[async_trait]
impl Resolver for DiscoveryResolver {
    async fn resolve(&self, env: &EnvironmentId) -> Result<Target, ResolveError> {
        let service = env.service_name();
        let instances = self.discover(&service).await?;
        let instance_count = instances.len();

        let selected = instances
            .iter()
            .filter(|instance| instance.is_healthy())
            .find_map(|instance| {
                instance
                    .target(self.config.default_port)
                    .map(|target| (instance.instance_id.as_deref().unwrap_or("-"), target))
            });

        match selected {
            Some((instance_id, target)) => {
                debug!(
                    env_id = %env,
                    service = %service,
                    instance_id,
                    instance_count,
                    target = %target,
                    "Discovered instance"
                );
                Ok(target)
            }
            None => Err(ResolveError::NoHealthyInstance { service }),
        }
    }

    fn name(&self) -> &'static str {
        "discovery"
    }
}
