//! Service configuration.
//!
//! Layered sources, later entries winning:
//!
//! 1. `/etc/mailflow/service.{toml,yaml,json}`
//! 2. `config/service.{toml,yaml,json}` relative to the working directory
//! 3. the file named by `MAILFLOW_CONFIG_FILE`
//! 4. environment variables with prefix `MAILFLOW` and `__` separators,
//!    e.g. `MAILFLOW__WORKER__CONCURRENCY=10`

use mailflow_core::routing::QueueTopology;
use mailflow_runtime::QueueName;
use serde::Deserialize;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration for '{field}': {message}")]
    Invalid { field: String, message: String },
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Top-level service configuration
///
/// Only settings the delivery binary consumes live here; submission-side
/// concerns (sender identity, template and status store endpoints) are
/// supplied by whoever embeds [`mailflow_core::submission::SubmissionService`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub queues: QueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent delivery workers; 5 to 20
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Blocking-receive timeout per poll cycle
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,
}

fn default_concurrency() -> usize {
    5
}

fn default_receive_timeout_secs() -> u64 {
    5
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            receive_timeout_secs: default_receive_timeout_secs(),
        }
    }
}

/// Which delivery transport the workers use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Log-only delivery for development
    Log,
    /// Provider REST API
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_transport_kind")]
    pub kind: TransportKind,

    /// Provider API base URL; required for the `http` transport
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_transport_kind() -> TransportKind {
    TransportKind::Log
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
            base_url: None,
            api_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_primary_queue")]
    pub primary: String,

    #[serde(default = "default_retry_queue")]
    pub retry: String,

    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter: String,
}

fn default_primary_queue() -> String {
    "email.notifications".to_string()
}

fn default_retry_queue() -> String {
    "email.retry".to_string()
}

fn default_dead_letter_queue() -> String {
    "email.dlq".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_queue(),
            retry: default_retry_queue(),
            dead_letter: default_dead_letter_queue(),
        }
    }
}

impl QueueConfig {
    /// Build the queue topology from the configured names
    pub fn topology(&self) -> Result<QueueTopology, ConfigError> {
        let parse = |field: &str, name: &str| {
            QueueName::new(name).map_err(|e| invalid(field, e.to_string()))
        };

        Ok(QueueTopology {
            primary: parse("queues.primary", &self.primary)?,
            retry: parse("queues.retry", &self.retry)?,
            dead_letter: parse("queues.dead_letter", &self.dead_letter)?,
        })
    }
}

impl ServiceConfig {
    /// Load from layered files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("/etc/mailflow/service").required(false))
            .add_source(config::File::with_name("config/service").required(false));

        if let Ok(path) = std::env::var("MAILFLOW_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&path));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("MAILFLOW").separator("__"))
            .build()?;

        let config: ServiceConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(5..=20).contains(&self.worker.concurrency) {
            return Err(invalid(
                "worker.concurrency",
                format!("must be 5-20, got {}", self.worker.concurrency),
            ));
        }

        if self.worker.receive_timeout_secs == 0 {
            return Err(invalid("worker.receive_timeout_secs", "must be positive"));
        }

        if self.transport.kind == TransportKind::Http && self.transport.base_url.is_none() {
            return Err(invalid(
                "transport.base_url",
                "required when transport.kind is 'http'",
            ));
        }

        self.queues.topology()?;

        Ok(())
    }
}
