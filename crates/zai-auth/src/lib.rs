//! Credential registry and access-token exchange for the zai gateway
//!
//! A credential is a raw secret held on behalf of an upstream account. The
//! gateway never sends it upstream directly: it is traded through the
//! [`CredentialExchange`] for a short-lived access token, which the pool then
//! leases out to requests.
//!
//! Credential flow:
//! 1. Operator registers a secret via `CredentialStore::add()`
//! 2. Pool calls `CredentialExchange::exchange()` for an access token
//! 3. Outcome is written back with `record_success()` / `record_failure()`
//! 4. Terminal exchange errors (`Error::is_terminal`) deactivate the credential

pub mod constants;
pub mod credentials;
pub mod error;
pub mod exchange;
pub mod jwt;

pub use constants::*;
pub use credentials::{Credential, CredentialStore};
pub use error::{Error, Result};
pub use exchange::{AccountInfo, CredentialExchange, ExchangedToken, HttpExchange};
