//! Credential pool for the zai gateway
//!
//! Turns registered credentials into leasable access tokens. The durable
//! `CredentialStore` decides which credentials exist and are active; the
//! ephemeral cache holds everything derived from them and may be lost at any
//! time without harm.
//!
//! Lease lifecycle:
//! 1. `refresh()` / `refresh_all()` exchange secrets for access tokens (AccessLease)
//! 2. `select()` claims one credential per cooldown window (RateLimitLease)
//! 3. Upstream 401 → `invalidate()` drops the lease via the reverse index
//! 4. Terminal or repeated exchange failures deactivate the credential
//! 5. Background task keeps leases fresh

pub mod cache;
pub mod error;
pub mod keys;
pub mod policy;
pub mod pool;
pub mod refresh;

#[cfg(test)]
mod testing;

pub use cache::{EphemeralCache, MemoryCache};
pub use error::{Error, Result};
pub use policy::{InsertionOrder, RoundRobin, ScanOrder, ScanPolicy};
pub use pool::{
    CredentialStatus, DEFAULT_BAN_THRESHOLD, DEFAULT_COOLDOWN_SECS, DEFAULT_REFRESH_THRESHOLD_SECS,
    Lease, PoolManager, PoolSettings, RefreshSummary, UsageStats,
};
pub use refresh::spawn_refresh_task;
