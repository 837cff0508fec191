//! Configuration system for the draft-generation worker
//!
//! Configuration is loaded from a TOML file. Secrets (broker credentials, LLM
//! API keys) are never stored in the file: the file names the environment
//! variables that hold them and they are resolved at runtime.

use crate::protocol::subjects::{canonicalize_subject, validate_subject};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main worker configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub worker: WorkerSection,
    pub mqtt: MqttSection,
    pub queue: QueueSection,
    pub llm: LlmSection,
}

/// Worker section - identity and in-process retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerSection {
    /// Worker identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// In-process retries; each message gets `max_retries + 1` attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound on the time spent on one message across all attempts
    #[serde(default = "default_processing_timeout")]
    pub processing_timeout_secs: u64,
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep-alive interval in seconds (default: 60)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Graceful drain budget on shutdown; 0 forces an immediate close
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// Cap on consecutive reconnection attempts (None = unlimited)
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
}

/// Queue section - subject, competing-consumer group and redelivery policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSection {
    /// Subject the draft-generation jobs are published on
    pub subject: String,
    /// Shared-subscription group; workers in the same group compete for messages
    pub queue_group: Option<String>,
    /// Broker-level redelivery limit applied by the consumer
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    /// Where messages that exhaust every retry are parked for operator replay
    pub dead_letter_subject: Option<String>,
    /// Informational message TTL, interpreted by consumers only
    pub ttl_secs: Option<u64>,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

/// LLM section - OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSection {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Model identifier
    pub model: String,
    /// Environment variable containing API key
    pub api_key_env: String,
    /// System prompt
    pub system_prompt: String,
    /// User prompt; `{user_id}` and `{idea_id}` are substituted per job
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
    /// Optional temperature (0.0 to 2.0)
    pub temperature: Option<f32>,
    /// Optional max tokens
    pub max_tokens: Option<u32>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_processing_timeout() -> u64 {
    300
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_max_redeliveries() -> u32 {
    3
}

fn default_max_in_flight() -> usize {
    16
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_prompt_template() -> String {
    "Write LinkedIn post drafts for idea {idea_id} on behalf of user {user_id}. \
     Reply with a JSON object of the form {\"drafts\": [{\"content\": \"...\"}]}."
        .to_string()
}

fn default_llm_timeout() -> u64 {
    60
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid worker ID format: {0}")]
    InvalidWorkerId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl WorkerConfig {
    /// Load configuration from TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: WorkerConfig = toml::from_str(content)?;
        config.validate()?;
        config.queue.subject = canonicalize_subject(&config.queue.subject);
        if let Some(dead_letter) = config.queue.dead_letter_subject.as_mut() {
            *dead_letter = canonicalize_subject(dead_letter);
        }
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_worker_id(&self.worker.id)?;

        validate_subject(&self.queue.subject)
            .map_err(|e| ConfigError::InvalidConfig(format!("queue.subject: {e}")))?;

        if let Some(dead_letter) = &self.queue.dead_letter_subject {
            validate_subject(dead_letter).map_err(|e| {
                ConfigError::InvalidConfig(format!("queue.dead_letter_subject: {e}"))
            })?;
            if canonicalize_subject(dead_letter) == canonicalize_subject(&self.queue.subject) {
                return Err(ConfigError::InvalidConfig(
                    "queue.dead_letter_subject must differ from queue.subject".to_string(),
                ));
            }
        }

        if let Some(group) = &self.queue.queue_group {
            let valid = !group.is_empty()
                && !group.contains(['/', '+', '#']);
            if !valid {
                return Err(ConfigError::InvalidConfig(format!(
                    "queue.queue_group '{group}' must be non-empty and contain no '/', '+' or '#'"
                )));
            }
        }

        if self.queue.max_in_flight == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue.max_in_flight must be greater than 0".to_string(),
            ));
        }

        if self.worker.processing_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "worker.processing_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.mqtt.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(temperature) = self.llm.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ConfigError::InvalidConfig(format!(
                    "llm.temperature {temperature} must be between 0.0 and 2.0"
                )));
            }
        }

        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Get LLM API key from environment variable
    pub fn get_llm_api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.llm.api_key_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.llm.api_key_env.clone()))
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.processing_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt.connect_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt.drain_timeout_secs)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[worker]
id = "test-worker"

[mqtt]
broker_url = "mqtt://localhost:1883"

[queue]
subject = "jobs/draft-generation"
queue_group = "draft-workers"

[llm]
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
system_prompt = "You write LinkedIn posts."
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// Validate worker ID format
fn validate_worker_id(worker_id: &str) -> Result<(), ConfigError> {
    let valid_chars = worker_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if worker_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidWorkerId(format!(
            "Worker ID '{worker_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[worker]
id = "worker-1"

[mqtt]
broker_url = "mqtt://localhost:1883"

[queue]
subject = "jobs/draft-generation"

[llm]
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
system_prompt = "You write LinkedIn posts."
"#;

    #[test]
    fn test_minimal_config_applies_defaults() {
        let config = WorkerConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.worker.max_retries, 2);
        assert_eq!(config.worker.processing_timeout_secs, 300);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(config.mqtt.connect_timeout_secs, 10);
        assert_eq!(config.mqtt.drain_timeout_secs, 5);
        assert_eq!(config.mqtt.max_reconnect_attempts, None);
        assert_eq!(config.queue.max_redeliveries, 3);
        assert_eq!(config.queue.max_in_flight, 16);
        assert!(config.queue.queue_group.is_none());
        assert!(config.queue.dead_letter_subject.is_none());
        assert_eq!(config.llm.base_url, "https://api.openai.com/v1");
        assert!(config.llm.prompt_template.contains("{idea_id}"));
    }

    #[test]
    fn test_subject_is_canonicalized_on_load() {
        let content = MINIMAL.replace("jobs/draft-generation", "/jobs//draft-generation/");
        let config = WorkerConfig::from_toml_str(&content).unwrap();
        assert_eq!(config.queue.subject, "jobs/draft-generation");
    }

    #[test]
    fn test_invalid_worker_id_rejected() {
        let content = MINIMAL.replace("worker-1", "worker 1!");
        let result = WorkerConfig::from_toml_str(&content);
        assert!(matches!(result, Err(ConfigError::InvalidWorkerId(_))));
    }

    #[test]
    fn test_wildcard_subject_rejected() {
        let content = MINIMAL.replace("jobs/draft-generation", "jobs/+");
        let result = WorkerConfig::from_toml_str(&content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_dead_letter_subject_must_differ() {
        let content = MINIMAL.replace(
            "subject = \"jobs/draft-generation\"",
            "subject = \"jobs/draft-generation\"\ndead_letter_subject = \"/jobs/draft-generation\"",
        );
        let result = WorkerConfig::from_toml_str(&content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_queue_group_rejected() {
        let content = MINIMAL.replace(
            "subject = \"jobs/draft-generation\"",
            "subject = \"jobs/draft-generation\"\nqueue_group = \"a/b\"",
        );
        let result = WorkerConfig::from_toml_str(&content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_temperature_out_of_range_rejected() {
        let content = format!("{MINIMAL}temperature = 3.5\n");
        let result = WorkerConfig::from_toml_str(&content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_in_flight_rejected() {
        let content = MINIMAL.replace(
            "subject = \"jobs/draft-generation\"",
            "subject = \"jobs/draft-generation\"\nmax_in_flight = 0",
        );
        let result = WorkerConfig::from_toml_str(&content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_api_key_env_reported() {
        let mut config = WorkerConfig::test_config();
        config.llm.api_key_env = "DRAFT_PIPELINE_TEST_SURELY_UNSET_KEY".to_string();
        let result = config.get_llm_api_key();
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound(_))));
    }

    #[test]
    fn test_duration_helpers() {
        let config = WorkerConfig::test_config();
        assert_eq!(config.processing_timeout(), Duration::from_secs(300));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.drain_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = WorkerConfig::test_config();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let reparsed = WorkerConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(config, reparsed);
    }
}
