//! Typed client for the cloud provider's droplet API.
//!
//! Thin wrapper over the DigitalOcean v2 wire format: bearer-token JSON
//! calls, no retries, no caching. Every lookup goes to the provider so
//! its view of the world is the only one; non-success responses carry
//! the provider's error body back verbatim inside `Provider` errors.

use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::http::{auth_headers, build_url, send_json};

pub const DEFAULT_API_BASE: &str = "https://api.digitalocean.com/v2";

#[derive(Debug, Clone, Deserialize)]
pub struct Droplet {
    pub id: u64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub networks: Networks,
    #[serde(default)]
    pub region: Region,
    #[serde(default)]
    pub size_slug: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Networks {
    #[serde(default)]
    pub v4: Vec<NetworkV4>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkV4 {
    pub ip_address: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Region {
    #[serde(default)]
    pub slug: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub created_at: String,
}

impl Droplet {
    /// First public IPv4 attachment, if any.
    pub fn public_ipv4(&self) -> Option<&str> {
        self.ipv4_of_kind("public")
    }

    /// First private (VPC) IPv4 attachment, if any.
    pub fn private_ipv4(&self) -> Option<&str> {
        self.ipv4_of_kind("private")
    }

    fn ipv4_of_kind(&self, kind: &str) -> Option<&str> {
        self.networks
            .v4
            .iter()
            .find(|net| net.kind == kind)
            .map(|net| net.ip_address.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateDropletRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image: Value,
    pub vpc_uuid: String,
    pub tags: Vec<String>,
    pub monitoring: bool,
    /// Always empty: access is exclusively through the private network.
    pub ssh_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

/// The create API takes an image slug as a string and a snapshot id as
/// a number.
pub fn image_value(image: &str) -> Value {
    match image.parse::<u64>() {
        Ok(id) => json!(id),
        Err(_) => json!(image),
    }
}

#[derive(Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Deserialize)]
struct DropletListEnvelope {
    #[serde(default)]
    droplets: Vec<Droplet>,
}

#[derive(Deserialize)]
struct SnapshotListEnvelope {
    #[serde(default)]
    snapshots: Vec<Snapshot>,
}

pub struct ProviderClient {
    base: String,
    token: String,
}

impl ProviderClient {
    /// `base` is the API root, e.g. `https://api.digitalocean.com/v2`.
    pub fn new(base: impl Into<String>, token: impl Into<String>) -> Self {
        let mut base = base.into();
        if !base.ends_with('/') {
            base.push('/');
        }
        Self {
            base,
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        build_url(&self.base, path)
    }

    async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<(StatusCode, String)> {
        send_json(method, url, body, auth_headers(&self.token)?).await
    }

    fn parse<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
        serde_json::from_str(body)
            .map_err(|err| OrchestratorError::Provider(format!("unexpected response shape: {err}")))
    }

    fn fail(status: StatusCode, body: &str) -> OrchestratorError {
        OrchestratorError::Provider(format!("HTTP {status}: {body}"))
    }

    /// Find the first droplet carrying `tag`, if any.
    pub async fn find_by_tag(&self, tag: &str) -> Result<Option<Droplet>> {
        let mut url = self.url("droplets")?;
        url.query_pairs_mut().append_pair("tag_name", tag);

        let (status, body) = self.request(Method::GET, url, None).await?;
        if !status.is_success() {
            return Err(Self::fail(status, &body));
        }
        let list: DropletListEnvelope = Self::parse(&body)?;
        Ok(list.droplets.into_iter().next())
    }

    pub async fn get(&self, id: u64) -> Result<Droplet> {
        let url = self.url(&format!("droplets/{id}"))?;
        let (status, body) = self.request(Method::GET, url, None).await?;
        if !status.is_success() {
            return Err(Self::fail(status, &body));
        }
        let envelope: DropletEnvelope = Self::parse(&body)?;
        Ok(envelope.droplet)
    }

    pub async fn create(&self, req: &CreateDropletRequest) -> Result<Droplet> {
        let url = self.url("droplets")?;
        let payload = serde_json::to_value(req)
            .map_err(|err| OrchestratorError::Provider(format!("encode create request: {err}")))?;

        debug!(name = %req.name, tags = ?req.tags, "creating droplet");
        let (status, body) = self.request(Method::POST, url, Some(payload)).await?;
        if !status.is_success() {
            return Err(Self::fail(status, &body));
        }
        let envelope: DropletEnvelope = Self::parse(&body)?;
        Ok(envelope.droplet)
    }

    pub async fn delete(&self, id: u64) -> Result<()> {
        let url = self.url(&format!("droplets/{id}"))?;
        let (status, body) = self.request(Method::DELETE, url, None).await?;
        if !status.is_success() {
            return Err(Self::fail(status, &body));
        }
        Ok(())
    }

    async fn action(&self, id: u64, body: Value) -> Result<()> {
        let url = self.url(&format!("droplets/{id}/actions"))?;
        let (status, text) = self.request(Method::POST, url, Some(body)).await?;
        if !status.is_success() {
            return Err(Self::fail(status, &text));
        }
        Ok(())
    }

    pub async fn shutdown(&self, id: u64) -> Result<()> {
        self.action(id, json!({ "type": "shutdown" })).await
    }

    pub async fn snapshot(&self, id: u64, name: &str) -> Result<()> {
        self.action(id, json!({ "type": "snapshot", "name": name }))
            .await
    }

    /// Snapshots taken of droplet `id`.
    pub async fn snapshots(&self, id: u64) -> Result<Vec<Snapshot>> {
        let url = self.url(&format!("droplets/{id}/snapshots"))?;
        let (status, body) = self.request(Method::GET, url, None).await?;
        if !status.is_success() {
            return Err(Self::fail(status, &body));
        }
        let list: SnapshotListEnvelope = Self::parse(&body)?;
        Ok(list.snapshots)
    }
}
