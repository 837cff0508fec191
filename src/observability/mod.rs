//! Observability: structured logging, per-component counters and the HTTP
//! health/metrics server.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{LatencyWindow, MetricsRegistry, MetricsSource, Snapshot};

pub use logging::{job_span, mqtt_span};
