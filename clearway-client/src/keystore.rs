//! Client-local persistence for the session key and bearer token.
//!
//! Two fixed-name JSON files under a configurable directory. Both are
//! destroyed on explicit disconnect; the session key is regenerated on the
//! next run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use clearway_core::{ClearwayError, ClearwayResult, SessionKey, StoredSessionKey};

const SESSION_KEY_FILE: &str = "session_key.json";
const BEARER_TOKEN_FILE: &str = "bearer_token.json";

#[derive(Serialize, Deserialize)]
struct StoredToken {
    token: String,
}

pub struct Keystore {
    dir: PathBuf,
}

impl Keystore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load the persisted session key, or generate and persist a fresh one.
    pub fn load_or_generate_session_key(&self) -> ClearwayResult<SessionKey> {
        if let Some(key) = self.load_session_key() {
            tracing::debug!(address = %key.address(), "loaded persisted session key");
            return Ok(key);
        }
        let key = SessionKey::generate();
        self.store_session_key(&key)?;
        tracing::info!(address = %key.address(), "generated new session key");
        Ok(key)
    }

    /// Unreadable or corrupt key material reads as absent, so the caller
    /// regenerates instead of failing startup.
    pub fn load_session_key(&self) -> Option<SessionKey> {
        let raw = std::fs::read_to_string(self.dir.join(SESSION_KEY_FILE)).ok()?;
        let stored: StoredSessionKey = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("discarding unreadable session key file: {}", e);
                return None;
            }
        };
        match SessionKey::from_stored(&stored) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!("discarding corrupt session key material: {}", e);
                None
            }
        }
    }

    pub fn store_session_key(&self, key: &SessionKey) -> ClearwayResult<()> {
        let raw = serde_json::to_string_pretty(&key.to_stored())?;
        self.write(SESSION_KEY_FILE, &raw)
    }

    pub fn load_bearer_token(&self) -> Option<String> {
        let raw = std::fs::read_to_string(self.dir.join(BEARER_TOKEN_FILE)).ok()?;
        serde_json::from_str::<StoredToken>(&raw).ok().map(|s| s.token)
    }

    pub fn store_bearer_token(&self, token: &str) -> ClearwayResult<()> {
        let raw = serde_json::to_string(&StoredToken {
            token: token.to_string(),
        })?;
        self.write(BEARER_TOKEN_FILE, &raw)
    }

    /// Destroy all persisted material.
    pub fn clear(&self) -> ClearwayResult<()> {
        for name in [SESSION_KEY_FILE, BEARER_TOKEN_FILE] {
            match std::fs::remove_file(self.dir.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ClearwayError::Storage(format!(
                        "failed to remove {}: {}",
                        name, e
                    )))
                }
            }
        }
        Ok(())
    }

    fn write(&self, name: &str, contents: &str) -> ClearwayResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            ClearwayError::Storage(format!("failed to create {}: {}", self.dir.display(), e))
        })?;
        let path = self.dir.join(name);
        std::fs::write(&path, contents)
            .map_err(|e| ClearwayError::Storage(format!("failed to write {}: {}", path.display(), e)))
    }

    /// Directory holding the persisted material.
    pub fn path(&self) -> &Path {
        &self.dir
    }
}
