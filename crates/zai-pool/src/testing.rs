//! Scripted exchange for pool tests

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use zai_auth::{AccountInfo, CredentialExchange, Error, ExchangedToken, Result};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Behaviour {
    /// Fresh token with no stated expiry
    Token,
    ExpiresIn(Duration),
    Transient,
    Terminal,
}

/// Exchange answering per secret; unknown secrets get `Behaviour::Token`.
///
/// Every issued token is unique so overwrites are observable.
pub(crate) struct FakeExchange {
    behaviours: Mutex<HashMap<String, Behaviour>>,
    calls: AtomicUsize,
}

impl FakeExchange {
    pub(crate) fn new() -> Self {
        Self {
            behaviours: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set(&self, secret: &str, behaviour: Behaviour) {
        self.behaviours
            .lock()
            .unwrap()
            .insert(secret.to_string(), behaviour);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialExchange for FakeExchange {
    fn exchange<'a>(
        &'a self,
        secret: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ExchangedToken>> + Send + 'a>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let behaviour = self
            .behaviours
            .lock()
            .unwrap()
            .get(secret)
            .copied()
            .unwrap_or(Behaviour::Token);

        let result = match behaviour {
            Behaviour::Token | Behaviour::ExpiresIn(_) => Ok(ExchangedToken {
                access_token: format!("at_{secret}_{n}"),
                expires_in: match behaviour {
                    Behaviour::ExpiresIn(d) => Some(d),
                    _ => None,
                },
                account: AccountInfo {
                    email: Some(format!("{secret}@example.com")),
                    name: None,
                },
            }),
            Behaviour::Transient => Err(Error::Exchange("upstream busy".into())),
            Behaviour::Terminal => Err(Error::InvalidSecret("token revoked".into())),
        };
        Box::pin(std::future::ready(result))
    }
}
