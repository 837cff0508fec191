//! Pure health monitoring and reconnection logic for the MQTT client

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to attempt another reconnect (pure function).
    /// `max_attempts: None` retries forever.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: config.calculate_backoff_delay(current_attempts + 1),
        }
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// The broker is answering if we heard from it within two keep-alive intervals.
    /// Any inbound packet counts, including ping responses.
    pub fn is_live(last_activity: Option<Instant>, keep_alive: Duration, now: Instant) -> bool {
        match last_activity {
            Some(at) => now.saturating_duration_since(at) <= keep_alive * 2,
            None => false,
        }
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "MQTT connection lost");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(attempt, "Starting reconnection attempt");
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!("Reconnection successful");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "MQTT connection permanently failed");
            }
            _ => {
                info!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}
