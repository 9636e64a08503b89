use anyhow::{anyhow, bail, Context, Result};
use log::warn;
use plexfm::{EligibilityPolicy, MonitorSettings};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plex Media Server to poll
    pub plex: PlexConfig,

    /// Last.fm credentials
    pub lastfm: LastFmConfig,

    /// Polling and network configuration
    pub monitoring: MonitoringConfig,

    /// Scrobble eligibility rules
    pub policy: EligibilityPolicy,

    /// Scrobble history configuration
    pub database: DatabaseConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlexConfig {
    pub server_url: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LastFmConfig {
    pub api_key: String,
    pub api_secret: String,
    pub session_key: String,

    /// Send track.updateNowPlaying whenever a new track starts
    pub now_playing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// How often to poll Plex (in milliseconds)
    pub poll_interval_ms: u64,

    /// How long to pause after a failed cycle (in seconds)
    pub error_backoff_secs: u64,

    /// Timeout for Plex requests (in seconds)
    pub request_timeout_secs: u64,

    /// Timeout for Last.fm requests (in seconds)
    pub submit_timeout_secs: u64,

    /// Retry budget for submissions (reserved for the network layer)
    pub max_retry_attempts: u32,

    /// Delay between submission retries (reserved for the network layer)
    pub retry_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite scrobble history
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<String>,
}

impl Default for PlexConfig {
    fn default() -> Self {
        PlexConfig {
            server_url: "http://localhost:32400".to_string(),
            token: String::new(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            poll_interval_ms: 500,
            error_backoff_secs: 5,
            request_timeout_secs: 10,
            submit_timeout_secs: 15,
            max_retry_attempts: 5,
            retry_interval_secs: 60,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: plexfm::DEFAULT_DB_PATH.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow!("Invalid value for {}: '{}' ({})", key, value, e))
}

impl Config {
    /// Load configuration from file, falling back to defaults
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)
                    .context("Failed to read configuration file")?;

                let config: Config = toml::from_str(&content)
                    .context("Failed to parse configuration file")?;

                Ok(config)
            } else {
                // Create default config file
                let default_config = Config::default();
                default_config.save(path)?;
                Ok(default_config)
            }
        } else {
            // No config file specified, use defaults
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        std::fs::write(path, toml_content)
            .context("Failed to write configuration file")?;

        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `KEY=value` overrides from any lookup, e.g. the environment
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("PLEX_SERVER_URL") {
            self.plex.server_url = value;
        }
        if let Some(value) = lookup("PLEX_TOKEN") {
            self.plex.token = value;
        }
        if let Some(value) = lookup("LASTFM_API_KEY") {
            self.lastfm.api_key = value;
        }
        if let Some(value) = lookup("LASTFM_API_SECRET") {
            self.lastfm.api_secret = value;
        }
        if let Some(value) = lookup("LASTFM_SESSION_KEY") {
            self.lastfm.session_key = value;
        }
        if let Some(value) = lookup("POLL_INTERVAL_MS") {
            self.monitoring.poll_interval_ms = parse_var("POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("MAX_RETRY_ATTEMPTS") {
            self.monitoring.max_retry_attempts = parse_var("MAX_RETRY_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("RETRY_INTERVAL") {
            self.monitoring.retry_interval_secs = parse_var("RETRY_INTERVAL", &value)?;
        }
        if let Some(value) = lookup("SCROBBLE_FALLBACK_TIMEOUT") {
            self.policy.fallback_override_secs = Some(parse_var("SCROBBLE_FALLBACK_TIMEOUT", &value)?);
        }
        if let Some(value) = lookup("PLEXFM_DATABASE") {
            self.database.path = value;
        }
        if let Some(value) = lookup("PLEXFM_LOG_FILE") {
            self.logging.file = Some(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitoring.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than 0");
        }

        if self.plex.server_url.is_empty() {
            bail!("plex.server_url is required");
        }

        let policy = &self.policy;
        if !(policy.ready_fraction > 0.0 && policy.ready_fraction <= 1.0) {
            bail!("policy.ready_fraction must be in (0, 1]");
        }
        if !(policy.replay_end_fraction > 0.0 && policy.replay_end_fraction <= 1.0) {
            bail!("policy.replay_end_fraction must be in (0, 1]");
        }
        if policy.ready_floor_secs < 0.0 || policy.ready_floor_secs > policy.ready_cap_secs {
            bail!("policy.ready_floor_secs must be between 0 and ready_cap_secs");
        }

        let lastfm = &self.lastfm;
        if lastfm.api_key.is_empty() || lastfm.api_secret.is_empty() || lastfm.session_key.is_empty() {
            warn!("Last.fm credentials are incomplete, scrobbles will be rejected");
        }

        Ok(())
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_millis(self.monitoring.poll_interval_ms),
            error_backoff: Duration::from_secs(self.monitoring.error_backoff_secs),
            send_now_playing: self.lastfm.now_playing,
        }
    }
}
