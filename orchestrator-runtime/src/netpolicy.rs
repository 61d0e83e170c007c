//! Per-container egress policy and inter-container routing rules.
//!
//! The orchestrator only stores and validates this shape; the agent
//! inside the sandbox turns it into firewall rules. Updates overwrite
//! the whole config, no partial patches.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::store::PersistentStore;

const CONFIG_KEY: &str = "config";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EgressMode {
    DenyAll,
    Allowlist,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EgressPolicy {
    pub mode: EgressMode,
    /// Domain patterns, exact or `*.` wildcard; only consulted in
    /// `allowlist` mode.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterContainerRule {
    pub from: String,
    pub to: String,
    pub ports: Vec<u16>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterContainerConfig {
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<InterContainerRule>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub containers: BTreeMap<String, EgressPolicy>,
    pub inter_container: InterContainerConfig,
}

impl Default for NetworkConfig {
    /// First-boot policy: three fully isolated containers and one
    /// allow-listed to its upstream APIs; inter-container routing off.
    fn default() -> Self {
        let deny = EgressPolicy {
            mode: EgressMode::DenyAll,
            allowed_domains: Vec::new(),
        };
        let mut containers = BTreeMap::new();
        containers.insert("container-1".to_string(), deny.clone());
        containers.insert("container-2".to_string(), deny.clone());
        containers.insert("container-3".to_string(), deny);
        containers.insert(
            "container-4".to_string(),
            EgressPolicy {
                mode: EgressMode::Allowlist,
                allowed_domains: vec!["api.runpod.ai".into(), "*.runpod.net".into()],
            },
        );

        Self {
            containers,
            inter_container: InterContainerConfig {
                enabled: false,
                rules: Vec::new(),
            },
        }
    }
}

impl NetworkConfig {
    /// Shape validation only. Domain-pattern syntax beyond
    /// non-empty/no-whitespace is the agent's concern and passes
    /// through.
    pub fn validate(&self) -> Result<()> {
        if self.containers.is_empty() {
            return Err(OrchestratorError::Validation(
                "network config must name at least one container".into(),
            ));
        }

        for (name, policy) in &self.containers {
            for domain in &policy.allowed_domains {
                if domain.is_empty() || domain.chars().any(char::is_whitespace) {
                    return Err(OrchestratorError::Validation(format!(
                        "container '{name}' has an invalid domain pattern: {domain:?}"
                    )));
                }
            }
        }

        for rule in &self.inter_container.rules {
            for endpoint in [&rule.from, &rule.to] {
                if !self.containers.contains_key(endpoint) {
                    return Err(OrchestratorError::Validation(format!(
                        "inter-container rule references unknown container '{endpoint}'"
                    )));
                }
            }
            if rule.ports.is_empty() {
                return Err(OrchestratorError::Validation(format!(
                    "inter-container rule {} -> {} has no ports",
                    rule.from, rule.to
                )));
            }
        }

        Ok(())
    }
}

/// Persisted network policy; serves the default until one is saved.
pub struct NetworkConfigStore {
    store: PersistentStore<NetworkConfig>,
}

impl NetworkConfigStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        Ok(Self {
            store: PersistentStore::open(path)?,
        })
    }

    pub fn get(&self) -> NetworkConfig {
        self.store.get(CONFIG_KEY).unwrap_or_default()
    }

    /// Validate and overwrite the stored config wholesale.
    pub fn set(&self, config: &NetworkConfig) -> Result<()> {
        config.validate()?;
        self.store.insert(CONFIG_KEY.to_string(), config.clone())
    }
}
