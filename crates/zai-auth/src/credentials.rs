//! Durable credential registry
//!
//! Credentials live in a JSON file holding an array ordered by id. All writes
//! use atomic temp-file + rename to prevent corruption on crash.
//!
//! The in-memory copy sits behind an `RwLock` that is only held while the
//! vector is read or changed, never across file I/O. A separate persist mutex
//! serializes writers so snapshots reach disk in the order they were taken.
//!
//! Ids are assigned sequentially, so iteration order is insertion order.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A registered upstream credential.
///
/// `secret` is the raw value handed to the exchange. It is written to the
/// credential file but never to logs: the `Debug` impl omits it.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: u64,
    pub secret: String,
    pub active: bool,
    /// Account label reported by the exchange (email or display name)
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Cumulative successful exchanges
    #[serde(default)]
    pub success_count: u64,
    /// Cumulative failed exchanges
    #[serde(default)]
    pub failure_count: u64,
    /// Failed exchanges since the last success
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Creation time as unix timestamp in milliseconds
    pub created_at: u64,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("active", &self.active)
            .field("label", &self.label)
            .field("last_error", &self.last_error)
            .field("success_count", &self.success_count)
            .field("failure_count", &self.failure_count)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish_non_exhaustive()
    }
}

/// Thread-safe credential file manager.
///
/// Reads clone out of the in-memory state and never wait on a disk write.
pub struct CredentialStore {
    path: PathBuf,
    state: RwLock<Vec<Credential>>,
    persist: Mutex<()>,
}

impl CredentialStore {
    /// Load credentials from the given file path.
    ///
    /// A missing file is a cold start: an empty `[]` file is created and the
    /// pool stays empty until credentials are registered.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let mut state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let credentials: Vec<Credential> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), credentials = credentials.len(), "loaded credentials");
            credentials
        } else {
            info!(path = %path.display(), "credential file not found, starting with empty store");
            let store = Vec::new();
            write_atomic(&path, &store).await?;
            store
        };
        state.sort_by_key(|c| c.id);

        Ok(Self {
            path,
            state: RwLock::new(state),
            persist: Mutex::new(()),
        })
    }

    /// Register a new secret. Starts active with clean counters.
    ///
    /// Rejects a secret that is already registered.
    pub async fn add(&self, secret: String) -> Result<Credential> {
        let _persist = self.persist.lock().await;
        let (credential, snapshot) = {
            let mut state = self.state.write().await;
            if state.iter().any(|c| c.secret == secret) {
                return Err(Error::Duplicate("secret already registered".into()));
            }
            let id = state.last().map_or(1, |c| c.id + 1);
            let credential = Credential {
                id,
                secret,
                active: true,
                label: None,
                last_error: None,
                success_count: 0,
                failure_count: 0,
                consecutive_failures: 0,
                created_at: now_millis(),
            };
            state.push(credential.clone());
            (credential, state.clone())
        };
        write_atomic(&self.path, &snapshot).await?;
        debug!(credential_id = credential.id, "added credential");
        Ok(credential)
    }

    pub async fn get(&self, id: u64) -> Option<Credential> {
        let state = self.state.read().await;
        state.iter().find(|c| c.id == id).cloned()
    }

    /// Snapshot of every credential in id order.
    pub async fn list(&self) -> Vec<Credential> {
        self.state.read().await.clone()
    }

    /// Snapshot of active credentials in id order.
    pub async fn active(&self) -> Vec<Credential> {
        let state = self.state.read().await;
        state.iter().filter(|c| c.active).cloned().collect()
    }

    /// Remove a credential and persist. Returns the removed credential if it existed.
    pub async fn remove(&self, id: u64) -> Result<Option<Credential>> {
        let _persist = self.persist.lock().await;
        let (removed, snapshot) = {
            let mut state = self.state.write().await;
            let Some(pos) = state.iter().position(|c| c.id == id) else {
                return Ok(None);
            };
            let removed = state.remove(pos);
            (removed, state.clone())
        };
        write_atomic(&self.path, &snapshot).await?;
        debug!(credential_id = id, "removed credential");
        Ok(Some(removed))
    }

    /// Enable or disable a credential.
    ///
    /// Re-enabling clears the failure streak and the last error so the
    /// credential is not banned again by its old history.
    pub async fn set_active(&self, id: u64, active: bool) -> Result<Credential> {
        self.mutate(id, |c| {
            c.active = active;
            if active {
                c.consecutive_failures = 0;
                c.last_error = None;
            }
        })
        .await
    }

    /// Record a successful exchange: bump the success counter, reset the
    /// failure streak, clear the error text and store the account label.
    pub async fn record_success(&self, id: u64, label: Option<String>) -> Result<Credential> {
        self.mutate(id, |c| {
            c.success_count += 1;
            c.consecutive_failures = 0;
            c.last_error = None;
            if label.is_some() {
                c.label = label;
            }
        })
        .await
    }

    /// Record a failed exchange.
    ///
    /// `deactivate` sees the credential with counters already bumped and
    /// decides, in the same critical section, whether to switch it off.
    pub async fn record_failure<F>(&self, id: u64, error: String, deactivate: F) -> Result<Credential>
    where
        F: FnOnce(&Credential) -> bool,
    {
        self.mutate(id, |c| {
            c.failure_count += 1;
            c.consecutive_failures = c.consecutive_failures.saturating_add(1);
            c.last_error = Some(error);
            if deactivate(c) {
                c.active = false;
            }
        })
        .await
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Apply `f` to one credential and persist, returning the updated copy.
    async fn mutate<F>(&self, id: u64, f: F) -> Result<Credential>
    where
        F: FnOnce(&mut Credential),
    {
        let _persist = self.persist.lock().await;
        let (updated, snapshot) = {
            let mut state = self.state.write().await;
            let credential = state
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| Error::NotFound(format!("credential {id} not in store")))?;
            f(credential);
            let updated = credential.clone();
            (updated, state.clone())
        };
        write_atomic(&self.path, &snapshot).await?;
        Ok(updated)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Write credentials to a file atomically.
///
/// Writes a temporary file in the same directory, then renames it over the
/// target. The file holds raw secrets, so permissions are 0600 on unix.
async fn write_atomic(path: &Path, data: &[Credential]) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
