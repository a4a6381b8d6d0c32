//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

fn default_url() -> String {
    "ws://localhost:8085".to_owned()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_authentication_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_base() -> Duration {
    Duration::from_millis(500)
}

fn default_reconnect_max() -> Duration {
    Duration::from_secs(30)
}

fn default_reconnect_jitter() -> f64 {
    0.2
}

fn default_subscription_debounce() -> Duration {
    Duration::from_millis(100)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Complete client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`ClientConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedClientConfig {
    pub config: ClientConfig,
    pub source: PathBuf,
}

impl ClientConfig {
    pub const ENV_CONFIG_PATH: &'static str = "EMS_LINK_CONFIG";

    /// Load configuration from disk, respecting the `EMS_LINK_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedClientConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedClientConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedClientConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Read and validate a single TOML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<ClientConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.endpoint.validate()?;
        self.timeouts.validate()?;
        self.reconnect.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for ClientConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: ClientConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Whether the client talks to an Edge directly or through a backend.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// One Edge, requests are sent unmodified.
    #[default]
    Direct,
    /// Many Edges multiplexed behind a backend, requests are wrapped.
    Backend,
}

impl ConnectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::Direct => "direct",
            ConnectionMode::Backend => "backend",
        }
    }

    pub fn is_backend(&self) -> bool {
        matches!(self, ConnectionMode::Backend)
    }
}

impl std::str::FromStr for ConnectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" | "edge" => Ok(ConnectionMode::Direct),
            "backend" => Ok(ConnectionMode::Backend),
            other => Err(format!("unknown connection mode: {}", other)),
        }
    }
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub mode: ConnectionMode,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            mode: ConnectionMode::default(),
        }
    }
}

impl EndpointConfig {
    /// Parsed endpoint URL.
    pub fn url(&self) -> Result<Url> {
        Url::parse(&self.url).with_context(|| format!("invalid endpoint url {}", self.url))
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.url()?;
        match url.scheme() {
            "ws" | "wss" => Ok(()),
            other => bail!("endpoint url scheme must be ws or wss, found {}", other),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_request_timeout", rename = "request_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request: Duration,
    #[serde(default = "default_authentication_timeout", rename = "authentication_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub authentication: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
            authentication: default_authentication_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<()> {
        if self.request.is_zero() {
            bail!("timeouts.request_ms must be greater than zero");
        }
        if self.authentication.is_zero() {
            bail!("timeouts.authentication_ms must be greater than zero");
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_base", rename = "base_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base: Duration,
    #[serde(default = "default_reconnect_max", rename = "max_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max: Duration,
    /// Fraction of the delay randomly added or removed, in `[0, 1]`.
    #[serde(default = "default_reconnect_jitter")]
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base: default_reconnect_base(),
            max: default_reconnect_max(),
            jitter: default_reconnect_jitter(),
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base.is_zero() {
            bail!("reconnect.base_ms must be greater than zero");
        }
        if self.base > self.max {
            bail!(
                "reconnect.base_ms ({}) exceeds reconnect.max_ms ({})",
                self.base.as_millis(),
                self.max.as_millis()
            );
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            bail!("reconnect.jitter must be within [0, 1], found {}", self.jitter);
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Coalescing window for `subscribeChannels`; zero sends immediately.
    #[serde(default = "default_subscription_debounce", rename = "debounce_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub debounce: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            debounce: default_subscription_debounce(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config: ClientConfig = "".parse().expect("defaults are valid");
        assert_eq!(config.endpoint.mode, ConnectionMode::Direct);
        assert_eq!(config.timeouts.request, Duration::from_secs(30));
        assert_eq!(config.timeouts.authentication, Duration::from_secs(10));
        assert_eq!(config.subscriptions.debounce, Duration::from_millis(100));
    }

    #[test]
    fn parses_all_sections() {
        let config: ClientConfig = r#"
            [endpoint]
            url = "wss://backend.example.invalid/websocket"
            mode = "backend"

            [timeouts]
            request_ms = 5000
            authentication_ms = 2000

            [reconnect]
            base_ms = 100
            max_ms = 1000
            jitter = 0.0

            [subscriptions]
            debounce_ms = 0

            [logging]
            format = "structured-json"
        "#
        .parse()
        .expect("valid configuration");
        assert!(config.endpoint.mode.is_backend());
        assert_eq!(config.timeouts.request, Duration::from_secs(5));
        assert_eq!(config.reconnect.max, Duration::from_secs(1));
        assert!(config.subscriptions.debounce.is_zero());
        assert_eq!(config.logging.format, LogFormat::StructuredJson);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!("[endpoint]\nurl = \"http://edge\"".parse::<ClientConfig>().is_err());
        assert!("[timeouts]\nrequest_ms = 0".parse::<ClientConfig>().is_err());
        assert!("[reconnect]\nbase_ms = 2000\nmax_ms = 1000"
            .parse::<ClientConfig>()
            .is_err());
        assert!("[reconnect]\njitter = 1.5".parse::<ClientConfig>().is_err());
    }

    #[test]
    fn loads_from_path_and_reports_missing_candidates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ems-link.toml");
        let mut file = fs::File::create(&path).expect("create config");
        writeln!(file, "[endpoint]\nmode = \"backend\"").expect("write config");

        let missing = dir.path().join("missing.toml");
        let loaded = ClientConfig::from_path(&path).expect("load config");
        assert!(loaded.endpoint.mode.is_backend());

        let err = ClientConfig::load(&[missing]).expect_err("nothing to load");
        assert!(err.to_string().contains("no configuration files found"));
    }

    #[test]
    fn mode_from_str_accepts_aliases() {
        assert_eq!("Backend".parse(), Ok(ConnectionMode::Backend));
        assert_eq!("edge".parse(), Ok(ConnectionMode::Direct));
        assert!("mesh".parse::<ConnectionMode>().is_err());
    }
}
