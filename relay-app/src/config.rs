//! Relay configuration loader.
//!
//! An optional TOML file provides the base values; environment variables
//! (including a `.env` file loaded at startup) override them.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_PREFIX: &str = "!gemini";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("GEMINI_API_KEY is not set; add it to the environment or a .env file")]
    MissingApiKey,

    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Clone, Deserialize)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Override for the API host (tests, proxies).
    #[serde(default)]
    pub base_url: Option<String>,
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            base_url: None,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Address prefix a message must start with. Empty disables prefix gating.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// The bot's own WhatsApp id. When unset it is asked from the transport at startup.
    #[serde(default)]
    pub self_id: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            self_id: None,
        }
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Bridge,
    Cloud,
}

impl std::str::FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bridge" => Ok(Self::Bridge),
            "cloud" => Ok(Self::Cloud),
            other => Err(ConfigError::Invalid(format!(
                "unsupported transport {other:?}; expected one of: bridge, cloud"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_url")]
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_bridge_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Skip messages already queued on the bridge when the relay starts.
    #[serde(default = "default_true")]
    pub start_from_latest: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
            auth_token: None,
            poll_interval_ms: default_bridge_poll_interval_ms(),
            start_from_latest: true,
        }
    }
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_bridge_poll_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
    #[serde(default)]
    pub webhook_verify_token: String,
    #[serde(default)]
    pub app_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    64
}

impl RelayConfig {
    /// Load from `path` (must exist) or the default path (optional), then apply
    /// environment overrides and validate.
    pub async fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::load_with_path(path).await.map(|(cfg, _)| cfg)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let (mut cfg, used) = Self::read_file(path).await?;
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok((cfg, used))
    }

    async fn read_file(path: Option<PathBuf>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let (path, required) = match path {
            Some(path) => (path, true),
            None => (default_config_path(), false),
        };
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Self::default(), None));
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        let cfg = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        Ok((cfg, Some(path)))
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply environment overrides. Blank values are ignored except for
    /// `BOT_PREFIX`, where an empty value disables prefix gating. A transport
    /// or port override that does not parse is an error.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_blank("GEMINI_API_KEY") {
            self.gemini.api_key = Some(v.trim().to_string());
        }
        if let Some(v) = non_blank("GEMINI_MODEL") {
            self.gemini.model = v.trim().to_string();
        }
        if let Some(v) = non_blank("GEMINI_BASE_URL") {
            self.gemini.base_url = Some(v.trim().to_string());
        }
        if let Some(v) = lookup("BOT_PREFIX") {
            self.bot.prefix = v.trim().to_string();
        }
        if let Some(v) = non_blank("BOT_SELF_ID") {
            self.bot.self_id = Some(v.trim().to_string());
        }
        if let Some(v) = non_blank("WA_RELAY_TRANSPORT") {
            self.transport.kind = v.parse()?;
        }
        if let Some(v) = non_blank("WHATSAPP_BRIDGE_URL") {
            self.transport.bridge.url = v.trim().to_string();
        }
        if let Some(v) = non_blank("WHATSAPP_BRIDGE_TOKEN") {
            self.transport.bridge.auth_token = Some(v.trim().to_string());
        }
        if let Some(v) = non_blank("WHATSAPP_ACCESS_TOKEN") {
            self.transport.cloud.access_token = v.trim().to_string();
        }
        if let Some(v) = non_blank("WHATSAPP_PHONE_NUMBER_ID") {
            self.transport.cloud.phone_number_id = v.trim().to_string();
        }
        if let Some(v) = non_blank("WHATSAPP_VERIFY_TOKEN") {
            self.transport.cloud.webhook_verify_token = v.trim().to_string();
        }
        if let Some(v) = non_blank("WHATSAPP_APP_SECRET") {
            self.transport.cloud.app_secret = Some(v.trim().to_string());
        }
        if let Some(v) = non_blank("WA_RELAY_PORT") {
            self.server.port = v.trim().parse().map_err(|e| {
                ConfigError::Invalid(format!("WA_RELAY_PORT={v:?} is not a valid port: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self
            .gemini
            .api_key
            .as_deref()
            .is_none_or(|k| k.trim().is_empty())
        {
            return Err(ConfigError::MissingApiKey);
        }
        if self.gemini.model.trim().is_empty() {
            return Err(ConfigError::Invalid("gemini.model is required".to_string()));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be > 0".to_string()));
        }
        match self.transport.kind {
            TransportKind::Bridge => {
                if self.transport.bridge.url.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "transport.bridge.url is required".to_string(),
                    ));
                }
                if self.transport.bridge.poll_interval_ms == 0 {
                    return Err(ConfigError::Invalid(
                        "transport.bridge.poll_interval_ms must be > 0".to_string(),
                    ));
                }
            }
            TransportKind::Cloud => {
                let cloud = &self.transport.cloud;
                if cloud.access_token.trim().is_empty() || cloud.phone_number_id.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "transport.cloud requires access_token and phone_number_id".to_string(),
                    ));
                }
                if cloud.webhook_verify_token.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "transport.cloud.webhook_verify_token is required".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The validated API key. Only meaningful after `validate` succeeded.
    pub fn api_key(&self) -> &str {
        self.gemini.api_key.as_deref().unwrap_or_default()
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".wa-relay").join("config.toml")
}
