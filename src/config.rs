//! Configuration parsing and validation for chatrelay.
//!
//! Loaded from TOML. Provider `url` and `api_key` values may reference
//! environment variables as `${VAR}`; a provider with no `api_key` picks one
//! up from `CHATRELAY_<NAME>_API_KEY` when that variable is set.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

/// Where finished turns are stored. Without a `[database]` table they live
/// in memory and are lost on restart.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "./chatrelay.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

const REDACTED: &str = "[REDACTED]";

/// Provider credential. Never printed or serialized in clear; read it with
/// [`ApiKey::expose_secret`].
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(ApiKey::from)
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        Self(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

/// How a provider's API key was obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Written out in the config file
    Literal,
    /// Built from `${VAR}` references
    EnvExpanded,
    /// Read from the provider's conventional variable (holds its name)
    Convention(String),
    /// No key; fine for local inference servers
    None,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Literal => f.write_str("config-literal"),
            KeySource::EnvExpanded => f.write_str("env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => f.write_str("none"),
        }
    }
}

/// One upstream endpoint speaking the OpenAI chat completions protocol.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Unique name for this provider
    pub name: String,
    /// Base URL of the OpenAI-compatible API (e.g., "http://127.0.0.1:8081/v1")
    pub url: String,
    pub api_key: Option<ApiKey>,
    /// Models served by this provider (empty means "any")
    #[serde(default)]
    pub models: Vec<String>,
    /// Routing priority; higher is preferred among equally healthy providers
    #[serde(default)]
    pub priority: i32,
    /// Maximum context length in tokens, if known
    pub context_length: Option<u32>,
    /// Capability tags such as "vision" or "local"
    #[serde(default)]
    pub tags: Vec<String>,
    /// Whole-request timeout for this provider
    pub timeout_secs: Option<u64>,
}

/// Gateway behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Maximum providers tried per turn before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Per-subscriber queue bound; a subscriber that falls this far behind is dropped
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    /// Replay buffer size in fragments before older fragments are coalesced
    #[serde(default = "default_replay_buffer")]
    pub replay_buffer: usize,
    /// How long a provider may take to produce its first fragment
    #[serde(default = "default_first_fragment_timeout_secs")]
    pub first_fragment_timeout_secs: u64,
    /// How long a streaming provider may go without sending a fragment
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Cancel the turn when the client that started it disconnects
    #[serde(default = "default_true")]
    pub cancel_on_disconnect: bool,
}

fn default_max_attempts() -> usize {
    3
}

fn default_subscriber_queue() -> usize {
    64
}

fn default_replay_buffer() -> usize {
    1024
}

fn default_first_fragment_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            subscriber_queue: default_subscriber_queue(),
            replay_buffer: default_replay_buffer(),
            first_fragment_timeout_secs: default_first_fragment_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            cancel_on_disconnect: true,
        }
    }
}

impl GatewayConfig {
    pub fn first_fragment_timeout(&self) -> Duration {
        Duration::from_secs(self.first_fragment_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// How degraded providers are ordered when more than one is a candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedOrdering {
    /// Same as healthy providers: priority, then latency
    #[default]
    Priority,
    /// Fewest consecutive failures first, then priority
    FewestFailures,
}

/// Provider health transition settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures that mark a healthy provider degraded
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    /// Re-admit unreachable providers as degraded after this long (disabled when unset)
    pub unreachable_cooldown_secs: Option<u64>,
    #[serde(default)]
    pub degraded_ordering: DegradedOrdering,
}

fn default_degraded_after() -> u32 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_after: default_degraded_after(),
            unreachable_cooldown_secs: None,
            degraded_ordering: DegradedOrdering::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default level for the `chatrelay` target; `RUST_LOG` overrides it
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Provider '{provider}' {field}: {problem}")]
    EnvVar {
        provider: String,
        field: &'static str,
        problem: ExpandError,
    },
}

/// Why a `${VAR}` reference could not be expanded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpandError {
    #[error("environment variable '{0}' is not set")]
    Missing(String),
    #[error("unclosed '${{' reference")]
    Unclosed,
    #[error("empty variable name in '${{}}'")]
    EmptyName,
}

/// Replace every `${VAR}` in `input` with `lookup(VAR)`.
fn expand_vars<F>(input: &str, lookup: &F) -> Result<String, ExpandError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some((literal, tail)) = rest.split_once("${") {
        out.push_str(literal);
        let (name, after) = tail.split_once('}').ok_or(ExpandError::Unclosed)?;
        if name.is_empty() {
            return Err(ExpandError::EmptyName);
        }
        let value = lookup(name).ok_or_else(|| ExpandError::Missing(name.to_string()))?;
        out.push_str(&value);
        rest = after;
    }

    out.push_str(rest);
    Ok(out)
}

/// Name of the variable a provider's key is read from when the config gives
/// none: "local-llama" -> "CHATRELAY_LOCAL_LLAMA_API_KEY".
pub fn convention_env_var_name(provider_name: &str) -> String {
    format!(
        "CHATRELAY_{}_API_KEY",
        provider_name.to_uppercase().replace(['-', ' ', '.'], "_")
    )
}

impl ProviderConfig {
    fn resolve_env<F>(&mut self, lookup: &F) -> Result<KeySource, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let expand = |value: &str, field: &'static str| {
            expand_vars(value, lookup).map_err(|problem| ConfigError::EnvVar {
                provider: self.name.clone(),
                field,
                problem,
            })
        };

        let url = expand(&self.url, "url")?;

        let (api_key, source) = match &self.api_key {
            Some(key) if key.expose_secret().contains("${") => (
                Some(ApiKey::from(expand(key.expose_secret(), "api_key")?)),
                KeySource::EnvExpanded,
            ),
            Some(key) => (Some(key.clone()), KeySource::Literal),
            None => {
                let var = convention_env_var_name(&self.name);
                match lookup(&var) {
                    Some(value) => (Some(ApiKey::from(value)), KeySource::Convention(var)),
                    None => (None, KeySource::None),
                }
            }
        };

        self.url = url;
        self.api_key = api_key;
        Ok(source)
    }
}

impl Config {
    /// Load configuration from a TOML file, without environment expansion.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::parse_str(&read_config(path.as_ref())?)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file and resolve `${VAR}` references and conventional
    /// key variables against the process environment.
    ///
    /// Returns the config together with where each provider's key came from.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let mut config: Config = toml::from_str(&read_config(path.as_ref())?)?;
        let key_sources = config.resolve_env_with(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok((config, key_sources))
    }

    /// Resolve environment references in every provider using `lookup`.
    pub fn resolve_env_with<F>(
        &mut self,
        lookup: F,
    ) -> Result<Vec<(String, KeySource)>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.providers
            .iter_mut()
            .map(|provider| -> Result<(String, KeySource), ConfigError> {
                let source = provider.resolve_env(&lookup)?;
                Ok((provider.name.clone(), source))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            tracing::warn!("No providers configured - every turn will fail to route");
        }

        let mut names = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.url.trim().is_empty() {
                return Err(invalid(format!("provider '{}' has no url", provider.name)));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(invalid(format!(
                    "provider '{}' is configured more than once",
                    provider.name
                )));
            }
        }

        let at_least_one = [
            ("gateway.max_attempts", self.gateway.max_attempts),
            ("gateway.subscriber_queue", self.gateway.subscriber_queue),
            ("gateway.replay_buffer", self.gateway.replay_buffer),
            ("gateway.idle_timeout_secs", self.gateway.idle_timeout_secs as usize),
            ("health.degraded_after", self.health.degraded_after as usize),
        ];
        if let Some((key, _)) = at_least_one.iter().find(|(_, value)| *value == 0) {
            return Err(invalid(format!("{} must be at least 1", key)));
        }

        Ok(())
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Validation(message)
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}
