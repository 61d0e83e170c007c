//! Sandbox instance lifecycle: spawn, kill, status, network pushes, and
//! the snapshot-build saga.
//!
//! The provider is the single source of truth: every operation starts
//! from a fresh tag query and nothing is cached between calls. Spawn and
//! kill serialize through a per-tag gate so two concurrent calls cannot
//! both observe "no instance" and both create one; the builder saga has
//! its own gate.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::http::agent_post_json;
use crate::netpolicy::NetworkConfig;
use crate::provider::{CreateDropletRequest, Droplet, ProviderClient, Snapshot, image_value};
use crate::session::now_secs;

/// Discovery tag for the primary sandbox droplet.
pub const SANDBOX_TAG: &str = "sandbox-instance";
/// Ceiling for the saga's doubling poll interval.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const SANDBOX_NAME: &str = "sandbox";
/// Discovery tag (and name) for the ephemeral snapshot builder.
pub const BUILDER_TAG: &str = "sandbox-builder";

/// Instance parameters and saga timing, resolved once at boot.
#[derive(Clone, Debug)]
pub struct SandboxSpec {
    pub region: String,
    pub size: String,
    /// Snapshot image the sandbox boots from; spawn refuses when unset.
    pub snapshot_image: Option<String>,
    pub vpc_uuid: String,
    pub builder_base_image: String,
    pub agent_port: u16,
    pub agent_timeout: Duration,
    pub poll_interval: Duration,
    pub phase_timeout: Duration,
    /// Extra wait after the builder goes active; cloud-init completion
    /// is not observable through the provider API.
    pub builder_settle: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SandboxState {
    NotCreated,
    Provisioning,
    Active,
    /// Any provider status outside the recognized set, verbatim.
    Other(String),
}

impl SandboxState {
    fn from_provider(status: &str) -> Self {
        match status {
            "new" => SandboxState::Provisioning,
            "active" => SandboxState::Active,
            other => SandboxState::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            SandboxState::NotCreated => "not_created",
            SandboxState::Provisioning => "provisioning",
            SandboxState::Active => "active",
            SandboxState::Other(status) => status,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SandboxStatus {
    #[serde(skip_serializing)]
    pub state: SandboxState,
    pub running: bool,
    pub status: String,
    pub droplet_id: Option<u64>,
    pub ip_address: Option<String>,
    pub private_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

impl SandboxStatus {
    fn not_created() -> Self {
        Self {
            state: SandboxState::NotCreated,
            running: false,
            status: "not_created".into(),
            droplet_id: None,
            ip_address: None,
            private_ip: None,
            created_at: None,
            region: None,
            size: None,
        }
    }

    fn from_droplet(droplet: &Droplet) -> Self {
        let state = SandboxState::from_provider(&droplet.status);
        Self {
            running: state == SandboxState::Active,
            status: state.label().to_string(),
            droplet_id: Some(droplet.id),
            ip_address: droplet.public_ipv4().map(str::to_string),
            private_ip: droplet.private_ipv4().map(str::to_string),
            created_at: (!droplet.created_at.is_empty()).then(|| droplet.created_at.clone()),
            region: (!droplet.region.slug.is_empty()).then(|| droplet.region.slug.clone()),
            size: (!droplet.size_slug.is_empty()).then(|| droplet.size_slug.clone()),
            state,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SnapshotResult {
    pub snapshot_id: u64,
    pub snapshot_name: String,
}

pub struct SandboxManager {
    provider: ProviderClient,
    spec: SandboxSpec,
    sandbox_gate: Mutex<()>,
    builder_gate: Mutex<()>,
}

impl SandboxManager {
    pub fn new(provider: ProviderClient, spec: SandboxSpec) -> Self {
        Self {
            provider,
            spec,
            sandbox_gate: Mutex::new(()),
            builder_gate: Mutex::new(()),
        }
    }

    /// Fresh provider query; `NotCreated` with no addresses when nothing
    /// carries the discovery tag.
    pub async fn status(&self) -> Result<SandboxStatus> {
        match self.provider.find_by_tag(SANDBOX_TAG).await? {
            Some(droplet) => Ok(SandboxStatus::from_droplet(&droplet)),
            None => Ok(SandboxStatus::not_created()),
        }
    }

    /// Create the sandbox droplet from the configured snapshot.
    ///
    /// Returns the new droplet id without waiting for it to go active.
    /// A second spawn while any tagged instance exists fails with
    /// `AlreadyRunning` and issues no create request.
    pub async fn spawn(&self) -> Result<u64> {
        let image = self
            .spec
            .snapshot_image
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                OrchestratorError::Validation("no sandbox snapshot configured".into())
            })?;

        let _gate = self.sandbox_gate.lock().await;

        if let Some(existing) = self.provider.find_by_tag(SANDBOX_TAG).await? {
            return Err(OrchestratorError::AlreadyRunning(existing.id));
        }

        let droplet = self
            .provider
            .create(&CreateDropletRequest {
                name: SANDBOX_NAME.into(),
                region: self.spec.region.clone(),
                size: self.spec.size.clone(),
                image: image_value(image),
                vpc_uuid: self.spec.vpc_uuid.clone(),
                tags: vec![SANDBOX_TAG.into()],
                monitoring: true,
                ssh_keys: Vec::new(),
                user_data: None,
            })
            .await?;

        info!(droplet_id = droplet.id, "sandbox droplet creating");
        Ok(droplet.id)
    }

    /// Destroy the sandbox droplet. Idempotent: absent is `Ok(None)`,
    /// no destroy request issued.
    pub async fn kill(&self) -> Result<Option<u64>> {
        let _gate = self.sandbox_gate.lock().await;

        match self.provider.find_by_tag(SANDBOX_TAG).await? {
            None => Ok(None),
            Some(droplet) => {
                self.provider.delete(droplet.id).await?;
                info!(droplet_id = droplet.id, "sandbox droplet destroyed");
                Ok(Some(droplet.id))
            }
        }
    }

    /// Push the network policy to the agent inside the running sandbox.
    ///
    /// Requires `Active` with a private address; the agent's own
    /// `{status, message}` reply is passed through unmodified.
    pub async fn apply_network_config(&self, config: &NetworkConfig) -> Result<Value> {
        let status = self.status().await?;
        if status.state != SandboxState::Active {
            return Err(OrchestratorError::NotRunning);
        }
        let private_ip = status.private_ip.ok_or(OrchestratorError::NotRunning)?;

        let payload = serde_json::to_value(config)
            .map_err(|err| OrchestratorError::ConfigApply(format!("encode config: {err}")))?;
        let agent_base = format!("http://{private_ip}:{}", self.spec.agent_port);

        info!(%private_ip, "pushing network config to sandbox agent");
        agent_post_json(&agent_base, "network/apply", payload, self.spec.agent_timeout).await
    }

    /// Build a fresh sandbox snapshot on a temporary builder droplet.
    ///
    /// Boots the builder from the base OS image with cloud-init that
    /// installs the container runtime, shuts it down, snapshots it, and
    /// destroys it. The builder is deleted no matter where the saga
    /// fails; only its creation failing skips cleanup (nothing exists).
    pub async fn build_snapshot(&self) -> Result<SnapshotResult> {
        let _gate = self.builder_gate.lock().await;

        if let Some(existing) = self.provider.find_by_tag(BUILDER_TAG).await? {
            return Err(OrchestratorError::Provider(format!(
                "builder droplet {} already exists; a build may be in progress",
                existing.id
            )));
        }

        let droplet = self
            .provider
            .create(&CreateDropletRequest {
                name: BUILDER_TAG.into(),
                region: self.spec.region.clone(),
                size: self.spec.size.clone(),
                image: image_value(&self.spec.builder_base_image),
                vpc_uuid: self.spec.vpc_uuid.clone(),
                tags: vec![BUILDER_TAG.into()],
                monitoring: false,
                ssh_keys: Vec::new(),
                user_data: Some(builder_user_data().into()),
            })
            .await?;
        let builder_id = droplet.id;
        info!(builder_id, "builder droplet created");

        let outcome = self.snapshot_steps(builder_id).await;
        let cleanup = self.provider.delete(builder_id).await;

        match (outcome, cleanup) {
            (Ok(snapshot), Ok(())) => {
                info!(builder_id, snapshot_id = snapshot.snapshot_id, "snapshot build complete");
                Ok(snapshot)
            }
            (Ok(snapshot), Err(err)) => {
                error!(builder_id, snapshot_id = snapshot.snapshot_id, %err, "builder cleanup failed after successful snapshot");
                Err(OrchestratorError::Provider(format!(
                    "snapshot {} created but builder droplet {builder_id} was not destroyed: {err}",
                    snapshot.snapshot_id
                )))
            }
            (Err(saga_err), Ok(())) => {
                warn!(builder_id, %saga_err, "snapshot build failed; builder destroyed");
                Err(saga_err)
            }
            (Err(saga_err), Err(cleanup_err)) => {
                error!(builder_id, %cleanup_err, "builder cleanup failed after saga error");
                Err(saga_err)
            }
        }
    }

    async fn snapshot_steps(&self, builder_id: u64) -> Result<SnapshotResult> {
        self.wait_for_droplet_status(builder_id, "active", "builder boot")
            .await?;
        if !self.spec.builder_settle.is_zero() {
            info!(
                settle_secs = self.spec.builder_settle.as_secs(),
                "builder active; waiting for cloud-init"
            );
            sleep(self.spec.builder_settle).await;
        }

        self.provider.shutdown(builder_id).await?;
        self.wait_for_droplet_status(builder_id, "off", "builder shutdown")
            .await?;

        let name = format!("sandbox-{}", now_secs());
        self.provider.snapshot(builder_id, &name).await?;
        let snapshots = self
            .wait_for_snapshots(builder_id, "snapshot completion")
            .await?;

        // Provider timestamps are RFC 3339, so the lexicographic max is
        // the newest.
        let newest = snapshots
            .into_iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .ok_or_else(|| OrchestratorError::Provider("no snapshot produced".into()))?;

        Ok(SnapshotResult {
            snapshot_id: newest.id,
            snapshot_name: newest.name,
        })
    }

    async fn wait_for_droplet_status(&self, id: u64, want: &str, phase: &str) -> Result<()> {
        let deadline = Instant::now() + self.spec.phase_timeout;
        let mut interval = self.spec.poll_interval;
        loop {
            let droplet = self.provider.get(id).await?;
            if droplet.status == want {
                info!(droplet_id = id, status = want, phase, "saga phase reached");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::SagaTimeout(format!(
                    "{phase}: droplet {id} still '{}' after {}s",
                    droplet.status,
                    self.spec.phase_timeout.as_secs()
                )));
            }
            sleep(interval).await;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }

    async fn wait_for_snapshots(&self, id: u64, phase: &str) -> Result<Vec<Snapshot>> {
        let deadline = Instant::now() + self.spec.phase_timeout;
        let mut interval = self.spec.poll_interval;
        loop {
            let snapshots = self.provider.snapshots(id).await?;
            if !snapshots.is_empty() {
                return Ok(snapshots);
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::SagaTimeout(format!(
                    "{phase}: no snapshot of droplet {id} after {}s",
                    self.spec.phase_timeout.as_secs()
                )));
            }
            sleep(interval).await;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }
}

/// Cloud-init for the builder droplet: container runtime plus a
/// readiness marker the baked image carries along.
fn builder_user_data() -> &'static str {
    r#"#cloud-config
package_update: true
packages:
  - docker.io
  - docker-compose
  - iptables-persistent

runcmd:
  - systemctl enable docker
  - systemctl start docker
  - mkdir -p /opt/sandbox
  - echo "Sandbox ready" > /opt/sandbox/ready
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Networks, Region};

    fn droplet(status: &str) -> Droplet {
        serde_json::from_value(serde_json::json!({
            "id": 42,
            "name": "sandbox",
            "status": status,
            "created_at": "2026-08-20T16:36:31Z",
            "size_slug": "s-2vcpu-2gb",
            "region": { "slug": "nyc1" },
            "networks": { "v4": [
                { "ip_address": "203.0.113.7", "type": "public" },
                { "ip_address": "10.10.0.5", "type": "private" }
            ]}
        }))
        .unwrap()
    }

    #[test]
    fn provider_status_maps_onto_state_machine() {
        assert_eq!(SandboxState::from_provider("new"), SandboxState::Provisioning);
        assert_eq!(SandboxState::from_provider("active"), SandboxState::Active);
        assert_eq!(
            SandboxState::from_provider("archive"),
            SandboxState::Other("archive".into())
        );
        assert_eq!(SandboxState::Other("archive".into()).label(), "archive");
    }

    #[test]
    fn status_record_extracts_addresses_by_type() {
        let status = SandboxStatus::from_droplet(&droplet("active"));
        assert!(status.running);
        assert_eq!(status.droplet_id, Some(42));
        assert_eq!(status.ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(status.private_ip.as_deref(), Some("10.10.0.5"));
        assert_eq!(status.region.as_deref(), Some("nyc1"));
    }

    #[test]
    fn provisioning_droplet_is_not_running() {
        let status = SandboxStatus::from_droplet(&droplet("new"));
        assert!(!status.running);
        assert_eq!(status.status, "provisioning");
    }

    #[test]
    fn not_created_status_serializes_with_null_addresses() {
        let value = serde_json::to_value(SandboxStatus::not_created()).unwrap();
        assert_eq!(value["running"], serde_json::json!(false));
        assert_eq!(value["status"], serde_json::json!("not_created"));
        assert!(value["droplet_id"].is_null());
        assert!(value["ip_address"].is_null());
        assert!(value["private_ip"].is_null());
        assert!(value.get("created_at").is_none());
    }

    #[test]
    fn droplet_without_networks_yields_no_addresses() {
        let bare = Droplet {
            id: 7,
            name: "sandbox".into(),
            status: "new".into(),
            created_at: String::new(),
            networks: Networks::default(),
            region: Region::default(),
            size_slug: String::new(),
        };
        let status = SandboxStatus::from_droplet(&bare);
        assert_eq!(status.ip_address, None);
        assert_eq!(status.private_ip, None);
        assert_eq!(status.created_at, None);
        assert_eq!(status.size, None);
    }

    #[test]
    fn builder_user_data_provisions_container_runtime() {
        let data = builder_user_data();
        assert!(data.starts_with("#cloud-config"));
        assert!(data.contains("docker.io"));
        assert!(data.contains("/opt/sandbox/ready"));
    }
}
