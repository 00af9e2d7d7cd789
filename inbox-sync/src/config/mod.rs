use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::types::error::InboxError;
use crate::types::{SessionIdentity, Teammate};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub session: SessionConfig,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    #[serde(default)]
    pub http: HttpConfig,
}

/// Who we are and where the server lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Push endpoint, e.g. `wss://inbox.example.com/ws/inbox/`
    pub ws_url: String,

    /// REST base, e.g. `https://inbox.example.com/api/`
    pub api_base_url: String,

    pub tenant_id: String,

    /// Teammate id of the signed-in user
    pub user_id: String,

    /// Display name for the signed-in user
    #[serde(default)]
    pub user_name: Option<String>,

    /// Primary sending address
    pub email: String,

    /// Extra addresses that count as the current user
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Bearer credential for REST calls
    pub token: TokenSource,
}

/// Token source - can be raw value or an environment variable to read
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenSource {
    /// Raw token value
    Raw(String),
    /// Environment variable holding the token
    Env { env: String },
}

/// Backoff used by the session when the push connection drops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Give up after this many consecutive failures (None = never)
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Fraction of the delay randomised in either direction (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Upper bound for every REST call, including optimistic commits
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: None,
            jitter: default_jitter(),
        }
    }
}

impl ReconnectPolicy {
    /// No automatic reconnection; the owner must call connect again itself
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// Delay before reconnect attempt number `attempt` (0-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Delay with symmetric random jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let base = self.base_delay(attempt).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base == 0.0 {
            return Duration::from_millis(base as u64);
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_millis((base * factor) as u64)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AppConfig {
    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, InboxError> {
        let config: AppConfig = toml::from_str(content)
            .map_err(|e| InboxError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), InboxError> {
        let s = &self.session;
        for (name, value) in [
            ("session.ws_url", &s.ws_url),
            ("session.api_base_url", &s.api_base_url),
            ("session.tenant_id", &s.tenant_id),
            ("session.user_id", &s.user_id),
            ("session.email", &s.email),
        ] {
            if value.trim().is_empty() {
                return Err(InboxError::Config(format!("{} must not be empty", name)));
            }
        }
        url::Url::parse(&s.ws_url)?;
        url::Url::parse(&s.api_base_url)?;
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(InboxError::Config(
                "reconnect.jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.http.timeout_secs == 0 {
            return Err(InboxError::Config(
                "http.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The session identity described by this configuration
    pub fn identity(&self) -> SessionIdentity {
        let s = &self.session;
        SessionIdentity {
            tenant_id: s.tenant_id.clone(),
            teammate: Teammate {
                id: s.user_id.clone(),
                name: s.user_name.clone().unwrap_or_else(|| s.email.clone()),
            },
            email: s.email.clone(),
            aliases: s.aliases.clone(),
        }
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // XDG config path
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("inbox-sync").join("config.toml"));
    }

    // Home directory fallback
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(
            home_dir
                .join(".config")
                .join("inbox-sync")
                .join("config.toml"),
        );
        paths.push(home_dir.join(".inbox-sync.rc"));
    }

    paths
}

/// Load configuration from the first default path that exists
pub fn load_config() -> Result<AppConfig, InboxError> {
    info!("Loading configuration from default paths");

    for path in default_config_paths() {
        if path.exists() {
            info!("Found config at: {:?}", path);
            return load_config_from_path(&path);
        }
    }

    Err(InboxError::Config(
        "No config file found in default locations".to_string(),
    ))
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<AppConfig, InboxError> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| InboxError::Config(format!("Failed to read config: {}", e)))?;

    AppConfig::from_toml(&content)
}
