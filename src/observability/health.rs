//! Health check HTTP server for container orchestration
//!
//! `/health` and `/ready` reflect transport liveness (and, for readiness, an
//! active subscription); `/live` only proves the process answers; `/metrics`
//! exports every registered component's counters.

use crate::messaging::Consumer;
use crate::observability::metrics::{MetricsRegistry, Snapshot};
use crate::transport::Transport;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
#[derive(Clone)]
pub struct HealthServer {
    worker_id: String,
    port: u16,
    transport: Arc<dyn Transport>,
    registry: Arc<MetricsRegistry>,
    consumer: Option<Arc<Consumer>>,
    started: Instant,
}

impl HealthServer {
    pub fn new(
        worker_id: impl Into<String>,
        port: u16,
        transport: Arc<dyn Transport>,
        registry: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            port,
            transport,
            registry,
            consumer: None,
            started: Instant::now(),
        }
    }

    /// Readiness additionally requires this consumer to be subscribed
    pub fn with_consumer(mut self, consumer: Arc<Consumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// All endpoints, without binding a socket
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self.clone();
        let metrics_server = self.clone();

        // GET /health - transport liveness
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.health_status().await;
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&status),
                        code,
                    ))
                }
            });

        // GET /ready - readiness probe
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = ready_server.clone();
                async move {
                    let ready = server.is_ready().await;
                    let response = ReadinessResponse {
                        ready,
                        timestamp: current_timestamp(),
                    };
                    let code = if ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&response),
                        code,
                    ))
                }
            });

        // GET /live - liveness probe
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET /metrics
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || warp::reply::json(&metrics_server.metrics()));

        health_route.or(ready_route).or(live_route).or(metrics_route)
    }

    /// Serve until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), warp::Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let routes = self.routes();

        let (bound, server) =
            warp::serve(routes).try_bind_with_graceful_shutdown(addr, async move {
                shutdown.cancelled().await;
            })?;
        tracing::info!(addr = %bound, "Health server listening");
        server.await;
        tracing::info!("Health server stopped");
        Ok(())
    }

    async fn health_status(&self) -> HealthStatus {
        let connected = self.transport.is_connected().await;
        let permanently_disconnected = self.transport.is_permanently_disconnected();

        let transport_check = if connected {
            HealthCheck::healthy("broker connection established")
        } else if permanently_disconnected {
            HealthCheck::unhealthy("broker connection permanently lost")
        } else {
            HealthCheck::unhealthy("broker disconnected")
        };

        let mut checks = BTreeMap::new();
        checks.insert("transport".to_string(), transport_check);

        let healthy = checks.values().all(|check| check.status == "healthy");
        HealthStatus {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            timestamp: current_timestamp(),
            worker_id: self.worker_id.clone(),
            uptime_seconds: self.started.elapsed().as_secs(),
            checks,
        }
    }

    async fn is_ready(&self) -> bool {
        if !self.transport.is_connected().await {
            return false;
        }
        match &self.consumer {
            Some(consumer) => consumer.is_subscribed().await,
            None => true,
        }
    }

    fn metrics(&self) -> MetricsResponse {
        let mut components = self.registry.snapshot_all();
        components.insert("transport".to_string(), self.transport.metrics());
        MetricsResponse {
            worker_id: self.worker_id.clone(),
            timestamp: current_timestamp(),
            uptime_seconds: self.started.elapsed().as_secs(),
            components,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    fn healthy(message: &str) -> Self {
        Self {
            status: "healthy".to_string(),
            message: Some(message.to_string()),
            last_check: current_timestamp(),
        }
    }

    fn unhealthy(message: &str) -> Self {
        Self {
            status: "unhealthy".to_string(),
            message: Some(message.to_string()),
            last_check: current_timestamp(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    worker_id: String,
    uptime_seconds: u64,
    checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    worker_id: String,
    timestamp: u64,
    uptime_seconds: u64,
    components: BTreeMap<String, Snapshot>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
