//! Pool manager: lease refresh, selection and invalidation
//!
//! The credential store is the single source of truth for which credentials
//! exist and whether they are active. Everything derived from a credential
//! (access token, cooldown marker, reverse index, usage counters) lives in the
//! ephemeral cache under keys built from the credential's hash.
//!
//! Lease lifecycle:
//! 1. `refresh()` exchanges the secret and writes AccessLease + ReverseIndex together
//! 2. `select()` claims a credential's RateLimitLease with an atomic `set_nx`
//! 3. `invalidate()` resolves a rejected token back to its credential and drops the lease
//! 4. Leases otherwise die by TTL and are rewritten by the refresh cycle

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use common::mask_secret;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use zai_auth::{Credential, CredentialExchange, CredentialStore, DEFAULT_ACCESS_TTL_SECS};

use crate::cache::EphemeralCache;
use crate::error::{Error, Result};
use crate::keys;
use crate::policy::ScanPolicy;

/// RateLimitLease lifetime.
pub const DEFAULT_COOLDOWN_SECS: u64 = 60;
/// Leases with less lifetime left than this are refreshed by `refresh_all`.
pub const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 600;
/// Consecutive refresh failures before a credential is deactivated.
pub const DEFAULT_BAN_THRESHOLD: u32 = 3;

/// Lease timing and deactivation policy.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Upper bound on AccessLease lifetime
    pub access_ttl: Duration,
    /// RateLimitLease lifetime
    pub cooldown: Duration,
    pub refresh_threshold: Duration,
    /// 0 disables streak-based deactivation
    pub ban_threshold: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            access_ttl: Duration::from_secs(DEFAULT_ACCESS_TTL_SECS),
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
            refresh_threshold: Duration::from_secs(DEFAULT_REFRESH_THRESHOLD_SECS),
            ban_threshold: DEFAULT_BAN_THRESHOLD,
        }
    }
}

/// A credential claimed for one request, with its live access token.
#[derive(Clone)]
pub struct Lease {
    pub credential_id: u64,
    pub credential_hash: String,
    pub access_token: String,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("credential_id", &self.credential_id)
            .field("credential_hash", &mask_secret(&self.credential_hash))
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// Success/failure counters for one credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub success: u64,
    pub failure: u64,
}

/// Admin view of one credential. Secrets and tokens are masked.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub id: u64,
    pub label: Option<String>,
    pub active: bool,
    pub secret: String,
    pub access_token: Option<String>,
    pub lease_ttl_secs: Option<u64>,
    pub cooling_down: bool,
    pub last_error: Option<String>,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub created_at: u64,
    pub usage: UsageStats,
}

/// Outcome counts of one `refresh_all` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Credential pool over a durable store and an ephemeral cache.
///
/// Holds no per-credential state of its own, so any number of `select()`
/// calls and a concurrent `refresh_all()` need no coordination beyond the
/// cache's atomic primitives.
pub struct PoolManager {
    store: Arc<CredentialStore>,
    exchange: Arc<dyn CredentialExchange>,
    cache: Arc<dyn EphemeralCache>,
    policy: Box<dyn ScanPolicy>,
    settings: PoolSettings,
}

impl PoolManager {
    pub fn new(
        store: Arc<CredentialStore>,
        exchange: Arc<dyn CredentialExchange>,
        cache: Arc<dyn EphemeralCache>,
        policy: Box<dyn ScanPolicy>,
        settings: PoolSettings,
    ) -> Self {
        info!(
            scan_order = policy.name(),
            cooldown_secs = settings.cooldown.as_secs(),
            access_ttl_secs = settings.access_ttl.as_secs(),
            "pool initialized"
        );
        Self {
            store,
            exchange,
            cache,
            policy,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Exchange a credential's secret and write a fresh lease.
    ///
    /// On failure the credential's streak is bumped; a terminal error or a
    /// streak reaching the ban threshold deactivates it and evicts its lease.
    #[instrument(skip_all, fields(credential_id = credential.id))]
    pub async fn refresh(&self, credential: &Credential) -> Result<()> {
        if !credential.active {
            return Err(Error::Inactive(credential.id));
        }

        let token = match self.exchange.exchange(&credential.secret).await {
            Ok(token) => token,
            Err(e) => return Err(self.record_refresh_failure(credential, e).await),
        };

        let hash = keys::hash(&credential.secret);
        let ttl = token
            .expires_in
            .map_or(self.settings.access_ttl, |remaining| {
                remaining.min(self.settings.access_ttl)
            })
            .max(Duration::from_secs(1));

        let access_key = keys::access(&hash);
        let previous = self.cache.get(&access_key).await?;
        self.cache
            .set_many(
                vec![
                    (access_key, token.access_token.clone()),
                    (keys::reverse(&keys::hash(&token.access_token)), hash.clone()),
                ],
                ttl,
            )
            .await?;

        // Overwritten lease: its reverse entry must not outlive it
        if let Some(previous) = previous.filter(|p| *p != token.access_token) {
            self.cache
                .delete_if_eq(&keys::reverse(&keys::hash(&previous)), &hash)
                .await?;
        }

        if let Err(e) = self
            .store
            .record_success(credential.id, token.account.label())
            .await
        {
            // Removed while the exchange was in flight
            self.evict_hash(&hash).await?;
            return Err(e.into());
        }

        counter!("pool_refresh_total", "result" => "success").increment(1);
        info!(ttl_secs = ttl.as_secs(), "access lease refreshed");
        Ok(())
    }

    async fn record_refresh_failure(&self, credential: &Credential, e: zai_auth::Error) -> Error {
        let terminal = e.is_terminal();
        let ban_threshold = self.settings.ban_threshold;
        counter!(
            "pool_refresh_total",
            "result" => if terminal { "terminal" } else { "failure" }
        )
        .increment(1);

        let updated = match self
            .store
            .record_failure(credential.id, e.to_string(), |c| {
                terminal || (ban_threshold > 0 && c.consecutive_failures >= ban_threshold)
            })
            .await
        {
            Ok(updated) => updated,
            Err(store_err) => {
                warn!(error = %store_err, "failed to record refresh failure");
                return Error::Refresh(e);
            }
        };

        if updated.active {
            warn!(
                error = %e,
                consecutive_failures = updated.consecutive_failures,
                "refresh failed, will retry next cycle"
            );
        } else {
            warn!(
                error = %e,
                terminal,
                consecutive_failures = updated.consecutive_failures,
                "credential deactivated"
            );
            if let Err(evict_err) = self.evict(&updated).await {
                warn!(error = %evict_err, "failed to evict lease of deactivated credential");
            }
        }
        Error::Refresh(e)
    }

    /// Refresh every active credential whose lease is missing or close to expiry.
    ///
    /// Failures are logged and counted; one credential never stops the pass.
    pub async fn refresh_all(&self) -> RefreshSummary {
        let mut summary = RefreshSummary::default();

        for credential in self.store.active().await {
            let access_key = keys::access(&keys::hash(&credential.secret));
            match self.cache.ttl(&access_key).await {
                Ok(Some(remaining)) if remaining > self.settings.refresh_threshold => {
                    summary.skipped += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(credential_id = credential.id, error = %e, "lease lookup failed, refreshing anyway");
                }
            }

            match self.refresh(&credential).await {
                Ok(()) => summary.refreshed += 1,
                Err(_) => summary.failed += 1,
            }
        }

        info!(
            refreshed = summary.refreshed,
            failed = summary.failed,
            skipped = summary.skipped,
            "refresh pass complete"
        );
        summary
    }

    /// Claim a leasable credential.
    ///
    /// A credential is leasable when it is active, has a live AccessLease and
    /// no RateLimitLease. The RateLimitLease is claimed with `set_nx`, so of N
    /// concurrent callers targeting the same credential exactly one wins.
    /// Returns `None` when nothing is leasable.
    #[instrument(skip_all)]
    pub async fn select(&self) -> Result<Option<Lease>> {
        let candidates = self.store.active().await;
        let n = candidates.len();
        if n == 0 {
            counter!("pool_selections_total", "outcome" => "empty").increment(1);
            debug!("no active credentials");
            return Ok(None);
        }

        let start = self.policy.start(n);
        for offset in 0..n {
            let credential = &candidates[(start + offset) % n];
            let hash = keys::hash(&credential.secret);
            let limit_key = keys::limit(&hash);

            if self.cache.exists(&limit_key).await? {
                continue;
            }
            let Some(access_token) = self.cache.get(&keys::access(&hash)).await? else {
                debug!(credential_id = credential.id, "no live lease");
                continue;
            };
            if !self
                .cache
                .set_nx(&limit_key, "1", self.settings.cooldown)
                .await?
            {
                continue;
            }

            counter!("pool_selections_total", "outcome" => "leased").increment(1);
            debug!(credential_id = credential.id, "credential leased");
            return Ok(Some(Lease {
                credential_id: credential.id,
                credential_hash: hash,
                access_token,
            }));
        }

        counter!("pool_selections_total", "outcome" => "exhausted").increment(1);
        debug!(candidates = n, "all active credentials busy or unleased");
        Ok(None)
    }

    /// Drop the lease behind an access token the upstream rejected.
    ///
    /// Returns `false` when the token is unknown or was already invalidated;
    /// only the call that actually removes the reverse entry records a failure.
    #[instrument(skip_all)]
    pub async fn invalidate(&self, access_token: &str) -> Result<bool> {
        let reverse_key = keys::reverse(&keys::hash(access_token));
        let Some(credential_hash) = self.cache.take(&reverse_key).await? else {
            debug!("token unknown or already invalidated");
            return Ok(false);
        };

        // A newer lease written by a concurrent refresh stays
        self.cache
            .delete_if_eq(&keys::access(&credential_hash), access_token)
            .await?;
        self.record_stat(&credential_hash, false).await;

        counter!("pool_invalidations_total").increment(1);
        info!(
            credential = %mask_secret(&credential_hash),
            "access lease invalidated"
        );
        Ok(true)
    }

    /// Bump a credential's usage counter. Best-effort.
    pub async fn record_stat(&self, credential_hash: &str, success: bool) {
        if let Err(e) = self
            .cache
            .incr(&keys::stats(credential_hash, success))
            .await
        {
            warn!(error = %e, success, "failed to record usage stat");
        }
    }

    pub async fn usage(&self, credential_hash: &str) -> UsageStats {
        UsageStats {
            success: self.read_counter(&keys::stats(credential_hash, true)).await,
            failure: self.read_counter(&keys::stats(credential_hash, false)).await,
        }
    }

    async fn read_counter(&self, key: &str) -> u64 {
        match self.cache.get(key).await {
            Ok(value) => value.and_then(|v| v.parse().ok()).unwrap_or(0),
            Err(e) => {
                warn!(error = %e, "failed to read usage stat");
                0
            }
        }
    }

    /// Remove a credential's lease, reverse entry and cooldown marker.
    pub async fn evict(&self, credential: &Credential) -> Result<()> {
        self.evict_hash(&keys::hash(&credential.secret)).await
    }

    async fn evict_hash(&self, hash: &str) -> Result<()> {
        let access_key = keys::access(hash);
        let mut doomed = vec![keys::limit(hash)];
        if let Some(token) = self.cache.get(&access_key).await? {
            doomed.push(keys::reverse(&keys::hash(&token)));
        }
        doomed.push(access_key);
        let removed = self.cache.delete_many(doomed).await?;
        debug!(removed, "lease evicted");
        Ok(())
    }

    /// Per-credential view for the admin API.
    pub async fn snapshot(&self) -> Vec<CredentialStatus> {
        let mut statuses = Vec::new();
        for credential in self.store.list().await {
            statuses.push(self.status_of(credential).await);
        }
        statuses
    }

    pub async fn status(&self, id: u64) -> Option<CredentialStatus> {
        let credential = self.store.get(id).await?;
        Some(self.status_of(credential).await)
    }

    async fn status_of(&self, credential: Credential) -> CredentialStatus {
        let hash = keys::hash(&credential.secret);
        let access_key = keys::access(&hash);
        let access_token = self.cache.get(&access_key).await.ok().flatten();
        let lease_ttl_secs = self
            .cache
            .ttl(&access_key)
            .await
            .ok()
            .flatten()
            .map(|ttl| ttl.as_secs());
        let cooling_down = self
            .cache
            .exists(&keys::limit(&hash))
            .await
            .unwrap_or(false);

        CredentialStatus {
            id: credential.id,
            label: credential.label.clone(),
            active: credential.active,
            secret: mask_secret(&credential.secret),
            access_token: access_token.as_deref().map(mask_secret),
            lease_ttl_secs,
            cooling_down,
            last_error: credential.last_error.clone(),
            success_count: credential.success_count,
            failure_count: credential.failure_count,
            consecutive_failures: credential.consecutive_failures,
            created_at: credential.created_at,
            usage: self.usage(&hash).await,
        }
    }

    /// Pool health summary for the health endpoint.
    ///
    /// A credential is available when it is active and holds a live lease.
    /// All available → healthy, some → degraded, none → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let statuses = self.snapshot().await;
        let total = statuses.len();
        let active = statuses.iter().filter(|s| s.active).count();
        let available = statuses
            .iter()
            .filter(|s| s.active && s.access_token.is_some())
            .count();
        let cooling = statuses
            .iter()
            .filter(|s| s.active && s.cooling_down)
            .count();

        let status = if available == total && total > 0 {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "credentials_total": total,
            "credentials_active": active,
            "credentials_available": available,
            "credentials_cooling_down": cooling,
            "credentials_disabled": total - active,
        })
    }
}
