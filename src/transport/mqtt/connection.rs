//! Pure connection state management for the MQTT client
//!
//! Connection states, backoff configuration and broker option construction.

use crate::config::MqttSection;
use crate::transport::TransportError;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// Maximum MQTT packet size; job envelopes are small but dead-letter records embed payloads
const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Backoff configuration, used for reconnection and for nack redelivery delays
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    pub fn from_section(config: &MqttSection) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            ..Default::default()
        }
    }

    /// Delay before 1-based `attempt`: the pattern, then the sustained delay forever
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.calculate_backoff_delay(attempt))
    }
}

/// Broker endpoint parsed from the configured URL
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://host[:port]` or `mqtts://host[:port]` (pure function)
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerAddress, TransportError> {
    let url =
        Url::parse(broker_url).map_err(|_| TransportError::InvalidBrokerUrl(broker_url.into()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(TransportError::InvalidBrokerUrl(broker_url.into())),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerUrl(broker_url.into()))?
        .to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerAddress { host, port, tls })
}

/// Build a unique client id so concurrent workers never evict each other
pub fn client_id(worker_id: &str) -> String {
    format!("draft-worker-{worker_id}-{}", uuid::Uuid::new_v4().simple())
}

/// Configure MQTT options from config
pub fn configure_mqtt_options(
    worker_id: &str,
    config: &MqttSection,
) -> Result<MqttOptions, TransportError> {
    let address = parse_broker_url(&config.broker_url)?;
    let mut mqtt_options = MqttOptions::new(client_id(worker_id), address.host, address.port);

    if address.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(username, password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));
    // The consumer decides when a message is acknowledged
    mqtt_options.set_manual_acks(true);

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section() -> MqttSection {
        crate::config::WorkerConfig::test_config().mqtt
    }

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.backoff_pattern, vec![25, 50, 100, 250]);
        assert_eq!(config.sustained_delay, 250);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::default();

        assert_eq!(config.calculate_backoff_delay(1), 25);
        assert_eq!(config.calculate_backoff_delay(2), 50);
        assert_eq!(config.calculate_backoff_delay(3), 100);
        assert_eq!(config.calculate_backoff_delay(4), 250);
        assert_eq!(config.calculate_backoff_delay(5), 250);
        assert_eq!(config.calculate_backoff_delay(100), 250);
        assert_eq!(config.backoff(0), Duration::from_millis(25));
    }

    #[test]
    fn test_from_section_carries_attempt_cap() {
        let mut mqtt = section();
        mqtt.max_reconnect_attempts = Some(7);
        assert_eq!(ReconnectConfig::from_section(&mqtt).max_attempts, Some(7));
    }

    #[test]
    fn test_parse_broker_url() {
        assert_eq!(
            parse_broker_url("mqtt://localhost").unwrap(),
            BrokerAddress {
                host: "localhost".into(),
                port: 1883,
                tls: false
            }
        );
        assert_eq!(
            parse_broker_url("mqtts://broker.example.com").unwrap().port,
            8883
        );
        assert_eq!(parse_broker_url("mqtt://10.0.0.5:1999").unwrap().port, 1999);
    }

    #[test]
    fn test_invalid_broker_url() {
        for url in ["invalid-url", "http://localhost:1883", ""] {
            assert!(
                matches!(
                    parse_broker_url(url),
                    Err(TransportError::InvalidBrokerUrl(_))
                ),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn test_client_ids_are_unique() {
        assert_ne!(client_id("w1"), client_id("w1"));
        assert!(client_id("w1").starts_with("draft-worker-w1-"));
    }

    #[test]
    fn test_configure_mqtt_options() {
        assert!(configure_mqtt_options("test-worker", &section()).is_ok());

        let mut bad = section();
        bad.broker_url = "nope".into();
        assert!(configure_mqtt_options("test-worker", &bad).is_err());
    }

    #[test]
    fn test_connection_state_equality() {
        assert_eq!(ConnectionState::Connected, ConnectionState::Connected);
        assert_ne!(
            ConnectionState::Connected,
            ConnectionState::Disconnected("x".into())
        );
    }
}
