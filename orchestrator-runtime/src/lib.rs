//! Control-plane runtime for a single-tenant cloud sandbox.
//!
//! One operator enrolls a TOTP authenticator and drives the lifecycle
//! of one sandbox droplet: spawn/kill/status against the provider API,
//! network-policy pushes to the agent inside the instance, and a
//! snapshot-build saga on an ephemeral builder droplet.

pub mod enrollment;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod netpolicy;
pub mod operator_api;
pub mod otp;
pub mod provider;
pub mod session;
pub mod settings;
pub mod store;

pub use error::{OrchestratorError, Result};
pub use lifecycle::{SandboxManager, SandboxSpec, SandboxState, SandboxStatus};
pub use operator_api::{AppState, operator_api_router};
pub use settings::Settings;
