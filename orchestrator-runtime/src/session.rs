//! Bearer session tokens backed by digest-keyed records.
//!
//! A token is 32 random bytes, hex-encoded, handed to the client exactly
//! once. The store only ever holds the SHA-256 digest of the token, so
//! reading the session file does not yield a usable credential. Expiry
//! is absolute (24h, no sliding renewal); expired records are deleted
//! the first time they are seen and swept periodically by the bin's GC
//! task.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::store::PersistentStore;

/// Session TTL in seconds (24 hours).
pub const SESSION_TTL_SECS: u64 = 86_400;

const TOKEN_BYTES: usize = 32;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub principal: String,
    pub created_at: u64,
    pub expires_at: u64,
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Single-writer store of active sessions, keyed by token digest.
pub struct SessionStore {
    store: PersistentStore<SessionRecord>,
}

impl SessionStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        Ok(Self {
            store: PersistentStore::open(path)?,
        })
    }

    /// Issue a new session for `principal` and return the raw token.
    ///
    /// The raw token is not retrievable afterwards; only its digest is
    /// stored.
    pub fn create(&self, principal: &str) -> Result<String> {
        self.purge_expired()?;

        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let now = now_secs();
        let record = SessionRecord {
            principal: principal.to_string(),
            created_at: now,
            expires_at: now + SESSION_TTL_SECS,
        };
        self.store.insert(digest(&token), record)?;
        info!(principal, "session created");

        Ok(token)
    }

    /// Validate a presented token and return its principal.
    ///
    /// Unknown and expired tokens both come back as `Unauthorized` with
    /// the same message; the expiry case additionally deletes the record.
    pub fn verify(&self, token: &str) -> Result<String> {
        if token.is_empty() {
            return Err(OrchestratorError::Unauthorized(
                "missing session token".into(),
            ));
        }

        let key = digest(token);
        let record = self.store.get(&key).ok_or_else(|| {
            OrchestratorError::Unauthorized("invalid or expired session".into())
        })?;

        if now_secs() > record.expires_at {
            self.store.remove(&key)?;
            debug!(principal = %record.principal, "expired session purged on access");
            return Err(OrchestratorError::Unauthorized(
                "invalid or expired session".into(),
            ));
        }

        Ok(record.principal)
    }

    /// Revoke one session. Succeeds whether or not the token was known.
    pub fn revoke(&self, token: &str) -> Result<()> {
        if token.is_empty() {
            return Ok(());
        }
        if self.store.remove(&digest(token))?.is_some() {
            info!("session revoked");
        }
        Ok(())
    }

    /// Revoke every session, rewriting the file empty.
    pub fn revoke_all(&self) -> Result<()> {
        self.store.clear()?;
        info!("all sessions revoked");
        Ok(())
    }

    /// Drop sessions past their expiry; returns how many were dropped.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = now_secs();
        let dropped = self.store.retain(|_, rec| rec.expires_at >= now)?;
        if dropped > 0 {
            debug!(dropped, "expired sessions purged");
        }
        Ok(dropped)
    }

    pub fn active_count(&self) -> usize {
        self.store.len()
    }
}
