//! Engine configuration.
//!
//! Settings come from an optional TOML file merged with `WF_ENGINE_*`
//! environment variables; every field has a usable default so an embedded
//! deployment can run with no configuration at all.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::approval::EscalationPolicy;
use crate::error::{EngineError, Result};

/// Top-level engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// PostgreSQL connection string. Unused by the in-memory store.
    pub database_url: String,
    /// How many times a stale-write conflict is retried before the operation
    /// fails with `Conflict`.
    pub conflict_retry_limit: u32,
    /// When true, a workflow start bound to an outdated definition version
    /// fails instead of silently snapshotting the latest.
    pub strict_version_check: bool,
    /// Escalation behavior for stage rules that configure none.
    pub default_escalation: EscalationPolicy,
    /// Broadcast channel capacity for published notifications.
    pub event_channel_capacity: usize,
    /// Poll cadence for due timers, for deployments on the null substrate.
    pub timer_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/wf_engine".to_string(),
            conflict_retry_limit: 3,
            strict_version_check: false,
            default_escalation: EscalationPolicy::Hold,
            event_channel_capacity: 1000,
            timer_poll_interval_ms: 1000,
        }
    }
}

impl EngineConfig {
    /// Load from an optional TOML string merged with `WF_ENGINE_*` variables.
    /// Environment wins over file, file wins over defaults.
    pub fn load(file_contents: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(contents) = file_contents {
            builder = builder.add_source(File::from_str(contents, FileFormat::Toml));
        }
        builder = builder.add_source(Environment::with_prefix("WF_ENGINE"));

        let config = builder
            .build()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| EngineError::Configuration(e.to_string()))
    }

    /// Build purely from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("WF_ENGINE_DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(limit) = std::env::var("WF_ENGINE_CONFLICT_RETRY_LIMIT") {
            config.conflict_retry_limit = limit.parse().map_err(|_| {
                EngineError::Configuration(format!(
                    "WF_ENGINE_CONFLICT_RETRY_LIMIT must be an integer, got '{limit}'"
                ))
            })?;
        }
        if let Ok(strict) = std::env::var("WF_ENGINE_STRICT_VERSION_CHECK") {
            config.strict_version_check = strict.parse().map_err(|_| {
                EngineError::Configuration(format!(
                    "WF_ENGINE_STRICT_VERSION_CHECK must be true or false, got '{strict}'"
                ))
            })?;
        }
        if let Ok(policy) = std::env::var("WF_ENGINE_DEFAULT_ESCALATION") {
            config.default_escalation = policy
                .parse()
                .map_err(|e: String| EngineError::Configuration(e))?;
        }
        if let Ok(capacity) = std::env::var("WF_ENGINE_EVENT_CHANNEL_CAPACITY") {
            config.event_channel_capacity = capacity.parse().map_err(|_| {
                EngineError::Configuration(format!(
                    "WF_ENGINE_EVENT_CHANNEL_CAPACITY must be an integer, got '{capacity}'"
                ))
            })?;
        }
        if let Ok(interval) = std::env::var("WF_ENGINE_TIMER_POLL_INTERVAL_MS") {
            config.timer_poll_interval_ms = interval.parse().map_err(|_| {
                EngineError::Configuration(format!(
                    "WF_ENGINE_TIMER_POLL_INTERVAL_MS must be an integer, got '{interval}'"
                ))
            })?;
        }

        Ok(config)
    }
}
