//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Inbound API keys are loaded from the GATEWAY_API_KEYS env var or
//! api_keys_file, never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use zai_pool::{PoolSettings, ScanOrder};

/// Env var holding comma-separated inbound API keys.
pub const API_KEYS_ENV: &str = "GATEWAY_API_KEYS";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    /// Model ids advertised on /v1/models
    #[serde(default = "default_models")]
    pub models: Vec<String>,
}

/// Listener and request-handling settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Extra attempts after the first, each with a newly selected credential
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// Path to a file with one API key per line (alternative to GATEWAY_API_KEYS)
    #[serde(default)]
    pub api_keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

/// Upstream chat backend
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Maximum silence between stream reads
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

/// Secret → access token exchange service
#[derive(Debug, Deserialize)]
pub struct ExchangeConfig {
    pub endpoint: String,
    #[serde(default = "default_exchange_timeout")]
    pub timeout_secs: u64,
}

/// Credential registry and lease policy
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
    /// Consecutive refresh failures before deactivation; 0 disables
    #[serde(default = "default_ban_threshold")]
    pub failure_ban_threshold: u32,
    #[serde(default)]
    pub scan_order: ScanOrder,
}

/// Request audit log
#[derive(Debug, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
    /// Entries kept in memory for /admin/logs
    #[serde(default = "default_retention")]
    pub retention: usize,
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_base_url() -> String {
    "https://zai.is".into()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    120
}

fn default_exchange_timeout() -> u64 {
    zai_auth::DEFAULT_EXCHANGE_TIMEOUT_SECS
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_access_ttl() -> u64 {
    zai_auth::DEFAULT_ACCESS_TTL_SECS
}

fn default_cooldown() -> u64 {
    zai_pool::DEFAULT_COOLDOWN_SECS
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_refresh_threshold() -> u64 {
    zai_pool::DEFAULT_REFRESH_THRESHOLD_SECS
}

fn default_ban_threshold() -> u32 {
    zai_pool::DEFAULT_BAN_THRESHOLD
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("audit.jsonl")
}

fn default_retention() -> usize {
    1000
}

fn default_models() -> Vec<String> {
    vec!["glm-4.6".into()]
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
            access_ttl_secs: default_access_ttl(),
            cooldown_secs: default_cooldown(),
            refresh_interval_secs: default_refresh_interval(),
            refresh_threshold_secs: default_refresh_threshold(),
            failure_ban_threshold: default_ban_threshold(),
            scan_order: ScanOrder::default(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
            retention: default_retention(),
        }
    }
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            access_ttl: Duration::from_secs(self.access_ttl_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
            refresh_threshold: Duration::from_secs(self.refresh_threshold_secs),
            ban_threshold: self.failure_ban_threshold,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

fn require_http_url(field: &str, value: &str) -> common::Result<()> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {value}"
        )))
    }
}

fn require_nonzero(field: &str, value: u64) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}

/// Split a comma- or newline-separated key list, dropping blanks.
fn parse_keys(raw: &str) -> Vec<Secret<String>> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| Secret::new(k.to_owned()))
        .collect()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// API key resolution order:
    /// 1. GATEWAY_API_KEYS env var
    /// 2. api_keys_file path from config
    ///
    /// No keys at all is a configuration error.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        require_http_url("upstream.base_url", &config.upstream.base_url)?;
        require_http_url("exchange.endpoint", &config.exchange.endpoint)?;
        require_nonzero(
            "upstream.connect_timeout_secs",
            config.upstream.connect_timeout_secs,
        )?;
        require_nonzero("upstream.read_timeout_secs", config.upstream.read_timeout_secs)?;
        require_nonzero("exchange.timeout_secs", config.exchange.timeout_secs)?;
        require_nonzero("pool.access_ttl_secs", config.pool.access_ttl_secs)?;
        require_nonzero("pool.cooldown_secs", config.pool.cooldown_secs)?;
        require_nonzero("pool.refresh_interval_secs", config.pool.refresh_interval_secs)?;
        if config.pool.refresh_threshold_secs >= config.pool.access_ttl_secs {
            return Err(common::Error::Config(format!(
                "pool.refresh_threshold_secs ({}) must be less than pool.access_ttl_secs ({})",
                config.pool.refresh_threshold_secs, config.pool.access_ttl_secs
            )));
        }

        if config.gateway.max_connections == 0 {
            return Err(common::Error::Config(
                "gateway.max_connections must be greater than 0".into(),
            ));
        }
        if config.audit.retention == 0 {
            return Err(common::Error::Config(
                "audit.retention must be greater than 0".into(),
            ));
        }
        if config.models.is_empty() {
            return Err(common::Error::Config(
                "models must list at least one model id".into(),
            ));
        }

        // Resolve API keys: env var takes precedence over file
        if let Ok(raw) = std::env::var(API_KEYS_ENV) {
            config.gateway.api_keys = parse_keys(&raw);
        } else if let Some(ref key_file) = config.gateway.api_keys_file {
            let raw = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_keys_file {}: {e}",
                    key_file.display()
                ))
            })?;
            config.gateway.api_keys = parse_keys(&raw);
        }

        if config.gateway.api_keys.is_empty() {
            return Err(common::Error::Config(format!(
                "no API keys configured: set {API_KEYS_ENV} or gateway.api_keys_file"
            )));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("zai-gateway.toml")
    }
}
