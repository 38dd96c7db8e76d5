//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Service configuration, read from `AI_JOBS_*` environment variables.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Root for `jobs/` and `sessions/`.
    pub data_dir: PathBuf,
    /// HTTP/WebSocket port.
    pub port: u16,
    /// Change notifier debounce window.
    pub debounce: Duration,
    /// Observer poll interval.
    pub poll_interval: Duration,
    /// Observers label a job stalled after this long in one stage.
    pub stall_threshold: Duration,
    /// Upper bound for a single runner step.
    pub step_timeout: Duration,
    /// Fail jobs left in a working stage by a previous process on startup.
    pub reap_orphans: bool,
    pub model: String,
    /// Directory for daily rolling log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            port: 8080,
            debounce: Duration::from_millis(50),
            poll_interval: Duration::from_millis(2000),
            stall_threshold: Duration::from_secs(120), // 2 minutes
            step_timeout: Duration::from_secs(300),    // 5 minutes
            reap_orphans: false,
            model: "claude-sonnet-4-20250514".to_string(),
            log_dir: None,
        }
    }
}

impl JobsConfig {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            data_dir: lookup("AI_JOBS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            port: parse(&lookup, "AI_JOBS_PORT")?.unwrap_or(defaults.port),
            debounce: parse(&lookup, "AI_JOBS_DEBOUNCE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.debounce),
            poll_interval: parse(&lookup, "AI_JOBS_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            stall_threshold: parse(&lookup, "AI_JOBS_STALL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.stall_threshold),
            step_timeout: parse(&lookup, "AI_JOBS_STEP_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.step_timeout),
            reap_orphans: parse(&lookup, "AI_JOBS_REAP_ORPHANS")?.unwrap_or(defaults.reap_orphans),
            model: lookup("AI_JOBS_MODEL").unwrap_or(defaults.model),
            log_dir: lookup("AI_JOBS_LOG_DIR").map(PathBuf::from),
        })
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }
}

/// Read the Anthropic API key.
pub fn api_key_from_env() -> Result<SecretString, ConfigError> {
    std::env::var("ANTHROPIC_API_KEY")
        .map(SecretString::from)
        .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}
