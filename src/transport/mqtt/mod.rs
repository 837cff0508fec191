//! MQTT v5 transport
//!
//! Pure logic is kept apart from I/O:
//!
//! - [`connection`] - connection state, backoff and broker options
//! - [`router`] - event routing decisions
//! - [`health_monitor`] - reconnection decisions and liveness
//! - [`client`] - the rumqttc-backed [`Transport`](crate::transport::Transport)
//!
//! ```rust,no_run
//! use draft_pipeline::config::WorkerConfig;
//! use draft_pipeline::transport::{mqtt::MqttClient, Transport};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = WorkerConfig::load_from_file("config/draft-worker.toml".as_ref())?;
//! let client = MqttClient::new(&config.worker.id, config.mqtt.clone());
//! client.connect(config.connect_timeout()).await?;
//! client.publish("jobs/draft-generation", b"{}".to_vec()).await?;
//! client.disconnect(Duration::from_secs(5)).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod router;

pub use client::MqttClient;
pub use connection::{ConnectionState, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use router::{EventRoute, EventRouter};
