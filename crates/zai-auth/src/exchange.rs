//! Secret → access token exchange
//!
//! The exchange is the login emulation that trades a raw credential secret
//! for a short-lived upstream access token. The gateway only depends on the
//! [`CredentialExchange`] trait; [`HttpExchange`] talks to an exchange
//! service over HTTP.
//!
//! This module is the boundary where free-form exchange failures are turned
//! into the closed [`Error`] taxonomy. Nothing downstream inspects error text.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::AUTH_INVALID_SIGNATURES;
use crate::error::{Error, Result};
use crate::jwt;

/// Account details reported alongside a fresh access token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl AccountInfo {
    /// Human-readable label: email when known, else name.
    pub fn label(&self) -> Option<String> {
        self.email.clone().or_else(|| self.name.clone())
    }
}

/// A derived access token.
#[derive(Debug, Clone)]
pub struct ExchangedToken {
    pub access_token: String,
    /// Remaining lifetime, when the exchange or the token itself says so
    pub expires_in: Option<Duration>,
    pub account: AccountInfo,
}

/// Trades a credential secret for an access token.
///
/// Uses `Pin<Box<dyn Future>>` for dyn-compatibility (`Arc<dyn CredentialExchange>`).
pub trait CredentialExchange: Send + Sync {
    fn exchange<'a>(
        &'a self,
        secret: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ExchangedToken>> + Send + 'a>>;
}

/// Wire shape of the exchange service response.
///
/// Either a token (under `token` or `access_token`) or an `error` string.
#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    #[serde(default, alias = "access_token")]
    token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default, alias = "account")]
    user_info: Option<AccountInfo>,
    #[serde(default)]
    error: Option<String>,
}

/// Exchange client backed by an HTTP login service.
///
/// POSTs `{"token": <secret>}` to `endpoint`.
pub struct HttpExchange {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpExchange {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        }
    }

    async fn exchange_inner(&self, secret: &str) -> Result<ExchangedToken> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "token": secret }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("exchange request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 401/403 means the secret itself was refused
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(Error::InvalidSecret(format!(
                    "exchange refused secret ({status}): {body}"
                )));
            }
            return Err(Error::Exchange(format!(
                "exchange endpoint returned {status}: {body}"
            )));
        }

        let parsed: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| Error::Exchange(format!("invalid exchange response: {e}")))?;

        if let Some(message) = parsed.error {
            return Err(classify_error_text(message));
        }

        let access_token = parsed
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Exchange("exchange returned no token".into()))?;

        let expires_in = parsed
            .expires_in
            .map(Duration::from_secs)
            .or_else(|| remaining_from_jwt(&access_token));

        debug!(has_expiry = expires_in.is_some(), "exchange succeeded");
        Ok(ExchangedToken {
            access_token,
            expires_in,
            account: parsed.user_info.unwrap_or_default(),
        })
    }
}

impl CredentialExchange for HttpExchange {
    fn exchange<'a>(
        &'a self,
        secret: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ExchangedToken>> + Send + 'a>> {
        Box::pin(self.exchange_inner(secret))
    }
}

/// Map exchange error text to the closed taxonomy.
///
/// Any auth-invalid signature makes the failure terminal; everything else
/// is transient.
pub fn classify_error_text(message: String) -> Error {
    let lower = message.to_lowercase();
    if AUTH_INVALID_SIGNATURES
        .iter()
        .any(|signature| lower.contains(signature))
    {
        Error::InvalidSecret(message)
    } else {
        Error::Exchange(message)
    }
}

/// Time left until the token's `exp` claim, if it has one in the future.
fn remaining_from_jwt(token: &str) -> Option<Duration> {
    let exp = jwt::expiry(token)?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    exp.checked_sub(now)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}
