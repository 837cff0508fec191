//! Impure I/O operations for the MQTT client
//!
//! A supervisor task owns the rumqttc event loop. It tracks connection state,
//! routes inbound publishes to subscriptions, counts broker acknowledgements
//! for `flush`, and reconnects with backoff. `EventLoop::poll` re-dials the
//! broker itself, so the `AsyncClient` handed to acknowledgers stays valid
//! across reconnects.

use super::connection::{configure_mqtt_options, ConnectionState, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::router::{EventRoute, EventRouter};
use crate::config::MqttSection;
use crate::observability::metrics::{ConnectionMetrics, Snapshot};
use crate::protocol::{
    canonicalize_subject, read_retry_count, redelivery_payload, subscription_filter,
    validate_subject,
};
use crate::transport::{
    Acknowledger, Delivery, Subscription, Transport, TransportError, TransportEvent,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Publish;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bounded request queue between `AsyncClient` handles and the event loop
const REQUEST_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 64;

struct Route {
    filter: String,
    sender: mpsc::UnboundedSender<Delivery>,
}

/// State shared between the client handle, the supervisor and acknowledgers
struct Shared {
    metrics: ConnectionMetrics,
    routes: Mutex<HashMap<String, Route>>,
    /// Subjects unsubscribed locally whose UNSUBACK may still be in flight
    draining: Mutex<HashSet<String>>,
    events: broadcast::Sender<TransportEvent>,
    state_tx: watch::Sender<ConnectionState>,
    published: AtomicU64,
    acked_tx: watch::Sender<u64>,
    last_activity: Mutex<Option<Instant>>,
    closing: AtomicBool,
    redelivery: ReconnectConfig,
}

impl Shared {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected("Not connected".into()));
        let (acked_tx, _) = watch::channel(0);
        Self {
            metrics: ConnectionMetrics::new(),
            routes: Mutex::new(HashMap::new()),
            draining: Mutex::new(HashSet::new()),
            events,
            state_tx,
            published: AtomicU64::new(0),
            acked_tx,
            last_activity: Mutex::new(None),
            closing: AtomicBool::new(false),
            redelivery: ReconnectConfig::default(),
        }
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<String, Route>> {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn draining(&self) -> MutexGuard<'_, HashSet<String>> {
        self.draining
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            HealthMonitor::log_state_transition(&previous, &next);
        }
    }

    /// Lifecycle notification; a send with no listeners is not an error
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
    }

    fn last_activity(&self) -> Option<Instant> {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn filters(&self) -> Vec<String> {
        self.routes()
            .values()
            .map(|route| route.filter.clone())
            .collect()
    }
}

struct Session {
    shutdown_tx: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

/// MQTT v5 implementation of [`Transport`]
pub struct MqttClient {
    worker_id: String,
    config: MqttSection,
    reconnect_config: ReconnectConfig,
    lifecycle: tokio::sync::Mutex<Option<Session>>,
    client: RwLock<Option<AsyncClient>>,
    shared: Arc<Shared>,
}

impl MqttClient {
    pub fn new(worker_id: &str, config: MqttSection) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            reconnect_config: ReconnectConfig::from_section(&config),
            config,
            lifecycle: tokio::sync::Mutex::new(None),
            client: RwLock::new(None),
            shared: Arc::new(Shared::new()),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.config.keep_alive_secs.max(5))
    }

    fn current_client(&self) -> Result<AsyncClient, TransportError> {
        self.client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn set_client(&self, client: Option<AsyncClient>) -> Option<AsyncClient> {
        let mut slot = self
            .client
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, client)
    }

    /// Wait for the supervisor to report the first ConnAck
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let confirmation = async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason)
                    | ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(TransportError::ConnectionFailed(reason.clone()));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectionFailed(
                        "State channel closed".to_string(),
                    ));
                }
            }
        };

        tokio::time::timeout(timeout, confirmation)
            .await
            .map_err(|_| TransportError::ConnectionTimeout(timeout))?
    }

    /// Sleep unless shutdown is requested first; returns false on shutdown
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            changed = shutdown_rx.changed() => changed.is_ok() && !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Owns the event loop until shutdown, an unrecoverable error or a closing disconnect
    async fn supervise(
        mut event_loop: EventLoop,
        client: AsyncClient,
        shared: Arc<Shared>,
        reconnect_config: ReconnectConfig,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ever_connected = false;
        let mut attempts = 0u32;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping MQTT supervisor");
                        break;
                    }
                }

                polled = event_loop.poll() => match polled {
                    Ok(event) => {
                        shared.touch();
                        match EventRouter::route_mqtt_event(&event) {
                            EventRoute::ConnectionAcknowledged => {
                                shared.set_state(HealthMonitor::determine_next_state(
                                    ConnectionEvent::ConnAckReceived,
                                ));
                                attempts = 0;
                                if ever_connected {
                                    shared.metrics.reconnects.incr();
                                    shared.emit(TransportEvent::Reconnected);
                                    Self::resubscribe(client.clone(), shared.filters());
                                }
                                ever_connected = true;
                            }
                            EventRoute::MessageReceived { topic, publish } => {
                                Self::dispatch(&shared, &client, topic, publish);
                            }
                            EventRoute::PublishAcknowledged => {
                                shared.acked_tx.send_modify(|acked| *acked += 1);
                            }
                            EventRoute::SubscriptionConfirmed { detail } => {
                                debug!(return_codes = %detail, "Subscription acknowledged");
                            }
                            EventRoute::Disconnected => {
                                if shared.state() == ConnectionState::Connected {
                                    shared.metrics.disconnects.incr();
                                }
                                let next = HealthMonitor::determine_next_state(
                                    ConnectionEvent::DisconnectedByBroker,
                                );
                                if let ConnectionState::Disconnected(reason) = &next {
                                    shared.emit(TransportEvent::Disconnected {
                                        reason: reason.clone(),
                                    });
                                }
                                shared.set_state(next);
                            }
                            EventRoute::Outgoing | EventRoute::Infrastructure(_) => {}
                        }
                    }
                    Err(connection_error) => {
                        if shared.closing.load(Ordering::SeqCst) {
                            debug!("Event loop closed after disconnect");
                            break;
                        }

                        let message = connection_error.to_string();
                        if !ever_connected {
                            shared.set_state(ConnectionState::Disconnected(message));
                            break;
                        }

                        shared.metrics.errors.incr();
                        shared.emit(TransportEvent::Error {
                            message: message.clone(),
                        });
                        if shared.state() == ConnectionState::Connected {
                            shared.metrics.disconnects.incr();
                            shared.emit(TransportEvent::Disconnected {
                                reason: message.clone(),
                            });
                            shared.set_state(HealthMonitor::determine_next_state(
                                ConnectionEvent::NetworkError(message),
                            ));
                        }

                        let shutting_down = *shutdown_rx.borrow();
                        match HealthMonitor::should_attempt_reconnection(
                            attempts,
                            &reconnect_config,
                            shutting_down,
                        ) {
                            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                                attempts = attempt;
                                shared.set_state(HealthMonitor::determine_next_state(
                                    ConnectionEvent::ReconnectionStarted(attempt),
                                ));
                                if !Self::interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                                    break;
                                }
                            }
                            ReconnectionDecision::AbortShutdownRequested => break,
                            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                                let reason =
                                    format!("Max reconnection attempts ({attempts}) exceeded");
                                shared.emit(TransportEvent::PermanentlyDisconnected {
                                    reason: reason.clone(),
                                });
                                shared.set_state(HealthMonitor::determine_next_state(
                                    ConnectionEvent::PermanentFailure(reason),
                                ));
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!("MQTT supervisor stopped");
    }

    /// Re-establish subscriptions after a reconnect without blocking the event loop
    fn resubscribe(client: AsyncClient, filters: Vec<String>) {
        tokio::spawn(async move {
            for filter in filters {
                match client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                    Ok(()) => debug!(filter = %filter, "Re-subscribed"),
                    Err(e) => error!(filter = %filter, error = %e, "Failed to re-subscribe"),
                }
            }
        });
    }

    /// Hand an inbound publish to its subscription, or settle it if nobody listens.
    ///
    /// A publish for a subject that is being unsubscribed was already assigned
    /// to this client by the broker, so it is redelivered instead of dropped.
    fn dispatch(shared: &Arc<Shared>, client: &AsyncClient, topic: String, publish: Publish) {
        shared.metrics.messages_received.incr();

        let key = EventRouter::route_key(&topic);
        let sender = if EventRouter::should_deliver(&topic, publish.retain) {
            shared.routes().get(&key).map(|route| route.sender.clone())
        } else {
            None
        };

        let payload = publish.payload.to_vec();
        let acker = MqttAcker {
            client: client.clone(),
            publish,
            shared: shared.clone(),
        };

        let orphan = match sender {
            Some(sender) => match sender.send(Delivery::new(key, payload, Box::new(acker))) {
                Ok(()) => return,
                Err(returned) => returned.0,
            },
            None => Delivery::new(key, payload, Box::new(acker)),
        };

        if shared.draining().contains(&orphan.subject) {
            debug!(topic = %topic, "Subscription draining, redelivering");
            tokio::spawn(async move {
                if let Err(e) = orphan.nack().await {
                    warn!(error = %e, "Failed to redeliver message for draining subscription");
                }
            });
            return;
        }

        debug!(topic = %topic, "No active subscription, acknowledging");
        tokio::spawn(async move {
            if let Err(e) = orphan.ack().await {
                warn!(error = %e, "Failed to acknowledge unrouted message");
            }
        });
    }
}

/// Settles one inbound publish. Nack republishes the payload with an
/// incremented retry counter after a backoff, then acks the original.
struct MqttAcker {
    client: AsyncClient,
    publish: Publish,
    shared: Arc<Shared>,
}

#[async_trait]
impl Acknowledger for MqttAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.client
            .ack(&self.publish)
            .await
            .map_err(|e| TransportError::AckFailed(e.to_string()))
    }

    async fn nack(&self) -> Result<(), TransportError> {
        let retry_count = read_retry_count(&self.publish.payload).unwrap_or(0);
        tokio::time::sleep(self.shared.redelivery.backoff(retry_count.saturating_add(1))).await;

        let topic = String::from_utf8_lossy(&self.publish.topic).to_string();
        self.shared.published.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self
            .client
            .publish(
                topic,
                QoS::AtLeastOnce,
                false,
                redelivery_payload(&self.publish.payload),
            )
            .await
        {
            self.shared.published.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::AckFailed(format!("redelivery failed: {e}")));
        }
        self.shared.metrics.messages_published.incr();
        self.ack().await
    }
}

#[async_trait]
impl Transport for MqttClient {
    async fn connect(&self, timeout: Duration) -> Result<(), TransportError> {
        if timeout.is_zero() {
            return Err(TransportError::InvalidTimeout);
        }

        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let mqtt_options = configure_mqtt_options(&self.worker_id, &self.config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        self.shared.closing.store(false, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting);
        let state_rx = self.shared.state_tx.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = tokio::spawn(Self::supervise(
            event_loop,
            client.clone(),
            self.shared.clone(),
            self.reconnect_config.clone(),
            shutdown_rx,
        ));

        if let Err(e) = Self::wait_for_connection_confirmation(state_rx, timeout).await {
            let _ = shutdown_tx.send(true);
            supervisor.abort();
            self.shared.metrics.errors.incr();
            self.shared
                .set_state(ConnectionState::Disconnected(e.to_string()));
            warn!(broker = %self.config.broker_url, error = %e, "MQTT connect failed");
            return Err(e);
        }

        self.set_client(Some(client));
        *lifecycle = Some(Session {
            shutdown_tx,
            supervisor,
        });
        self.shared.metrics.connections.incr();
        self.shared.emit(TransportEvent::Connected);
        info!(broker = %self.config.broker_url, "Connected to MQTT broker");
        Ok(())
    }

    async fn disconnect(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(mut session) = lifecycle.take() else {
            return Ok(());
        };

        if timeout.is_zero() {
            let _ = session.shutdown_tx.send(true);
            session.supervisor.abort();
            self.set_client(None);
        } else {
            let deadline = tokio::time::Instant::now() + timeout;
            if let Err(e) = self.flush(timeout).await {
                warn!(error = %e, "Outstanding publishes not acknowledged before disconnect");
            }

            let filters = self.shared.filters();
            if let Some(client) = self.set_client(None) {
                for filter in filters {
                    if let Err(e) = client.unsubscribe(filter.clone()).await {
                        debug!(filter = %filter, error = %e, "Unsubscribe during drain failed");
                    }
                }
                self.shared.closing.store(true, Ordering::SeqCst);
                if let Err(e) = client.disconnect().await {
                    debug!(error = %e, "DISCONNECT request failed");
                }
            }

            if tokio::time::timeout_at(deadline, &mut session.supervisor)
                .await
                .is_err()
            {
                warn!("MQTT supervisor did not stop before the drain timeout, aborting");
                let _ = session.shutdown_tx.send(true);
                session.supervisor.abort();
            }
        }

        self.shared.routes().clear();
        self.shared.metrics.disconnects.incr();
        self.shared
            .set_state(ConnectionState::Disconnected("Client disconnected".into()));
        self.shared.emit(TransportEvent::Disconnected {
            reason: "client disconnect".into(),
        });
        info!("MQTT client disconnected");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.current_client().is_ok()
            && self.shared.state() == ConnectionState::Connected
            && HealthMonitor::is_live(
                self.shared.last_activity(),
                self.keep_alive(),
                Instant::now(),
            )
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        validate_subject(subject)?;
        let client = self.current_client()?;
        if !HealthMonitor::can_publish(&self.shared.state()) {
            return Err(TransportError::NotConnected);
        }

        let subject = canonicalize_subject(subject);
        self.shared.published.fetch_add(1, Ordering::SeqCst);
        match client
            .publish(subject.clone(), QoS::AtLeastOnce, false, payload)
            .await
        {
            Ok(()) => {
                self.shared.metrics.messages_published.incr();
                debug!(subject = %subject, "Published");
                Ok(())
            }
            Err(e) => {
                self.shared.published.fetch_sub(1, Ordering::SeqCst);
                self.shared.metrics.errors.incr();
                Err(TransportError::PublishFailed(e.to_string()))
            }
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), TransportError> {
        self.current_client()?;
        let target = self.shared.published.load(Ordering::SeqCst);
        let mut acked = self.shared.acked_tx.subscribe();

        let caught_up = async {
            loop {
                if *acked.borrow_and_update() >= target {
                    return;
                }
                if acked.changed().await.is_err() {
                    return;
                }
            }
        };

        tokio::time::timeout(timeout, caught_up)
            .await
            .map_err(|_| TransportError::FlushTimeout(timeout))
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, TransportError> {
        validate_subject(subject)?;
        let client = self.current_client()?;
        let subject = canonicalize_subject(subject);
        let filter = subscription_filter(&subject, queue_group);
        let (sender, receiver) = mpsc::unbounded_channel();

        {
            let mut routes = self.shared.routes();
            if routes.contains_key(&subject) {
                return Err(TransportError::AlreadySubscribed(subject));
            }
            self.shared.draining().remove(&subject);
            routes.insert(
                subject.clone(),
                Route {
                    filter: filter.clone(),
                    sender,
                },
            );
        }

        if let Err(e) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
            self.shared.routes().remove(&subject);
            return Err(TransportError::SubscribeFailed(e.to_string()));
        }

        info!(subject = %subject, filter = %filter, "Subscribed");
        Ok(Subscription::new(subject, receiver))
    }

    async fn unsubscribe(&self, subject: &str) -> Result<(), TransportError> {
        let subject = canonicalize_subject(subject);
        let Some(route) = self.shared.routes().remove(&subject) else {
            return Ok(());
        };
        self.shared.draining().insert(subject.clone());

        if let Ok(client) = self.current_client() {
            client
                .unsubscribe(route.filter.clone())
                .await
                .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        }
        info!(subject = %subject, "Unsubscribed");
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.shared.state(),
            ConnectionState::PermanentlyDisconnected(_)
        )
    }

    fn metrics(&self) -> Snapshot {
        self.shared.metrics.snapshot()
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(session) = self.lifecycle.get_mut().take() {
            let _ = session.shutdown_tx.send(true);
            session.supervisor.abort();
        }
    }
}
