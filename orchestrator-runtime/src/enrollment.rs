//! One-time operator enrollment of a TOTP authenticator.
//!
//! Exactly one secret exists per deployment. `begin` hands out a fresh
//! candidate secret without persisting anything; only `complete`, which
//! proves the operator's authenticator produces matching codes, writes
//! it. There is no rotation flow: once enrolled, further enrollment
//! attempts are refused.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{OrchestratorError, Result};
use crate::otp;
use crate::session::now_secs;
use crate::store::PersistentStore;

const SECRET_KEY: &str = "totp";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SecretRecord {
    secret: String,
    created_at: u64,
}

/// A not-yet-persisted enrollment candidate shown to the operator.
#[derive(Clone, Debug, Serialize)]
pub struct EnrollmentOffer {
    pub secret: String,
    pub provisioning_uri: String,
}

pub struct EnrollmentStore {
    store: PersistentStore<SecretRecord>,
}

impl EnrollmentStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        Ok(Self {
            store: PersistentStore::open(path)?,
        })
    }

    pub fn is_enrolled(&self) -> bool {
        self.store.get(SECRET_KEY).is_some()
    }

    /// Generate a candidate secret and its authenticator-app URI.
    ///
    /// Repeatable until `complete` succeeds; nothing is stored here.
    pub fn begin(&self, domain: &str) -> Result<EnrollmentOffer> {
        if self.is_enrolled() {
            return Err(OrchestratorError::AlreadyEnrolled);
        }

        let secret = otp::generate_secret();
        let issuer = format!("Sandbox@{domain}");
        let provisioning_uri = otp::provisioning_uri(&secret, "admin", &issuer)?;

        Ok(EnrollmentOffer {
            secret,
            provisioning_uri,
        })
    }

    /// Persist `secret` after the operator proves possession with a
    /// current code.
    pub fn complete(&self, secret: &str, code: &str) -> Result<()> {
        if self.is_enrolled() {
            return Err(OrchestratorError::AlreadyEnrolled);
        }
        otp::verify_code(secret, code, now_secs())?;

        self.store.insert(
            SECRET_KEY.to_string(),
            SecretRecord {
                secret: secret.to_string(),
                created_at: now_secs(),
            },
        )?;
        info!("operator enrollment completed");
        Ok(())
    }

    /// Validate a login code against the stored secret.
    pub fn verify_login(&self, code: &str) -> Result<()> {
        let record = self
            .store
            .get(SECRET_KEY)
            .ok_or(OrchestratorError::NotEnrolled)?;
        otp::verify_code(&record.secret, code, now_secs())
    }
}
