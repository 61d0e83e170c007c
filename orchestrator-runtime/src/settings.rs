//! Environment-driven configuration, loaded once at boot.

use std::time::Duration;

use crate::error::{OrchestratorError, Result};
use crate::lifecycle::SandboxSpec;
use crate::provider::DEFAULT_API_BASE;

#[derive(Clone, Debug)]
pub struct Settings {
    pub provider_token: String,
    pub provider_base: String,
    pub vpc_uuid: String,
    pub region: String,
    pub size: String,
    pub snapshot_image: Option<String>,
    pub builder_base_image: String,
    pub domain: String,
    pub port: u16,
    pub agent_port: u16,
    pub agent_timeout: Duration,
    pub saga_poll_interval: Duration,
    pub saga_phase_timeout: Duration,
    pub builder_settle: Duration,
    pub session_gc_interval: Duration,
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| OrchestratorError::Validation(format!("{name} must be set")))
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(name, default))
}

impl Settings {
    /// Required: `PROVIDER_API_TOKEN`, `SANDBOX_VPC_UUID`. Everything
    /// else has a default; `SANDBOX_SNAPSHOT_ID` may stay unset, in
    /// which case spawn refuses until a snapshot is built and
    /// configured.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            provider_token: require_env("PROVIDER_API_TOKEN")?,
            provider_base: env_or("PROVIDER_API_BASE", DEFAULT_API_BASE),
            vpc_uuid: require_env("SANDBOX_VPC_UUID")?,
            region: env_or("SANDBOX_REGION", "nyc1"),
            size: env_or("SANDBOX_SIZE", "s-2vcpu-2gb"),
            snapshot_image: std::env::var("SANDBOX_SNAPSHOT_ID")
                .ok()
                .filter(|v| !v.is_empty()),
            builder_base_image: env_or("BUILDER_BASE_IMAGE", "ubuntu-24-04-x64"),
            domain: env_or("ORCHESTRATOR_DOMAIN", "localhost"),
            port: env_parse("ORCHESTRATOR_PORT", 8080),
            agent_port: env_parse("SANDBOX_AGENT_PORT", 9999),
            agent_timeout: env_secs("AGENT_TIMEOUT_SECS", 30),
            saga_poll_interval: env_secs("SAGA_POLL_INTERVAL_SECS", 5),
            saga_phase_timeout: env_secs("SAGA_PHASE_TIMEOUT_SECS", 300),
            builder_settle: env_secs("BUILDER_SETTLE_SECS", 60),
            session_gc_interval: env_secs("SESSION_GC_INTERVAL_SECS", 300),
        })
    }

    pub fn sandbox_spec(&self) -> SandboxSpec {
        SandboxSpec {
            region: self.region.clone(),
            size: self.size.clone(),
            snapshot_image: self.snapshot_image.clone(),
            vpc_uuid: self.vpc_uuid.clone(),
            builder_base_image: self.builder_base_image.clone(),
            agent_port: self.agent_port,
            agent_timeout: self.agent_timeout,
            poll_interval: self.saga_poll_interval,
            phase_timeout: self.saga_phase_timeout,
            builder_settle: self.builder_settle,
        }
    }
}
