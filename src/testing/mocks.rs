//! Mock implementations for testing
//!
//! An in-memory broker and transport, a mock LLM provider, a scripted use case,
//! a recording message handler and repositories that always fail, so the
//! pipeline can be exercised without a broker, a database or an LLM.

use crate::jobs::{Draft, Job, JobError, JobErrorRepository, JobRepository, JobStatus, RepositoryError};
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, TokenUsage,
};
use crate::messaging::{HandlerError, MessageHandler};
use crate::observability::metrics::{ConnectionMetrics, Snapshot};
use crate::protocol::{canonicalize_subject, redelivery_payload, validate_subject};
use crate::transport::{
    Acknowledger, Delivery, Subscription, Transport, TransportError, TransportEvent,
};
use crate::usecase::{DraftRequest, GenerateDrafts, UseCaseError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub type PublishedMessage = (String, Vec<u8>);

struct MockSubscriber {
    client_id: u64,
    subject: String,
    group: Option<String>,
    sender: mpsc::UnboundedSender<Delivery>,
}

/// In-memory broker shared by any number of [`MockTransport`] clients.
///
/// Plain subscribers each receive every message; members of a queue group
/// receive messages round-robin, one member per message.
#[derive(Default)]
pub struct MockBroker {
    subscribers: Mutex<Vec<MockSubscriber>>,
    cursors: Mutex<HashMap<(String, String), usize>>,
    published: Mutex<Vec<PublishedMessage>>,
    acks: Mutex<Vec<PublishedMessage>>,
    nacks: Mutex<Vec<PublishedMessage>>,
    redeliver_on_nack: AtomicBool,
    next_client_id: AtomicU64,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            redeliver_on_nack: AtomicBool::new(true),
            ..Default::default()
        })
    }

    /// Whether a nack re-publishes the payload with `retry_count + 1` (default: yes)
    pub fn set_redeliver_on_nack(&self, redeliver: bool) {
        self.redeliver_on_nack.store(redeliver, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub async fn published_to(&self, subject: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub async fn acks(&self) -> Vec<PublishedMessage> {
        self.acks.lock().await.clone()
    }

    pub async fn nacks(&self) -> Vec<PublishedMessage> {
        self.nacks.lock().await.clone()
    }

    /// Wait until at least `count` deliveries were acked or nacked
    pub async fn wait_for_settled(&self, count: usize, timeout: Duration) -> bool {
        let settled = async {
            loop {
                if self.acks.lock().await.len() + self.nacks.lock().await.len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, settled).await.is_ok()
    }

    /// Deliver a message as if another producer had published it
    pub async fn inject(self: &Arc<Self>, subject: &str, payload: Vec<u8>) {
        self.route(&canonicalize_subject(subject), payload).await;
    }

    async fn publish(self: &Arc<Self>, subject: &str, payload: Vec<u8>) {
        self.published
            .lock()
            .await
            .push((subject.to_string(), payload.clone()));
        self.route(subject, payload).await;
    }

    async fn route(self: &Arc<Self>, subject: &str, payload: Vec<u8>) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|s| !s.sender.is_closed());

        let mut targets = Vec::new();
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, subscriber) in subscribers.iter().enumerate() {
            if subscriber.subject != subject {
                continue;
            }
            match &subscriber.group {
                Some(group) => groups.entry(group.clone()).or_default().push(index),
                None => targets.push(index),
            }
        }

        let mut cursors = self.cursors.lock().await;
        for (group, members) in groups {
            let cursor = cursors.entry((subject.to_string(), group)).or_insert(0);
            targets.push(members[*cursor % members.len()]);
            *cursor += 1;
        }

        for index in targets {
            let delivery = Delivery::new(
                subject.to_string(),
                payload.clone(),
                Box::new(MockAcker {
                    broker: self.clone(),
                    subject: subject.to_string(),
                    payload: payload.clone(),
                }),
            );
            let _ = subscribers[index].sender.send(delivery);
        }
    }

    async fn add_subscriber(&self, subscriber: MockSubscriber) {
        self.subscribers.lock().await.push(subscriber);
    }

    async fn has_subscription(&self, client_id: u64, subject: &str) -> bool {
        self.subscribers
            .lock()
            .await
            .iter()
            .any(|s| s.client_id == client_id && s.subject == subject && !s.sender.is_closed())
    }

    async fn remove_subscribers(&self, client_id: u64, subject: Option<&str>) {
        self.subscribers.lock().await.retain(|s| {
            s.client_id != client_id || subject.is_some_and(|subject| s.subject != subject)
        });
    }
}

struct MockAcker {
    broker: Arc<MockBroker>,
    subject: String,
    payload: Vec<u8>,
}

#[async_trait]
impl Acknowledger for MockAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.broker
            .acks
            .lock()
            .await
            .push((self.subject.clone(), self.payload.clone()));
        Ok(())
    }

    async fn nack(&self) -> Result<(), TransportError> {
        self.broker
            .nacks
            .lock()
            .await
            .push((self.subject.clone(), self.payload.clone()));
        if self.broker.redeliver_on_nack.load(Ordering::SeqCst) {
            self.broker
                .route(&self.subject, redelivery_payload(&self.payload))
                .await;
        }
        Ok(())
    }
}

/// Mock transport for testing: one client connection to a [`MockBroker`]
pub struct MockTransport {
    broker: Arc<MockBroker>,
    client_id: u64,
    connected: AtomicBool,
    permanently_disconnected: AtomicBool,
    fail_connect: bool,
    publish_calls: AtomicUsize,
    failing_publishes: std::sync::Mutex<Vec<usize>>,
    flush_failure: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    metrics: ConnectionMetrics,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Client on its own private broker
    pub fn new() -> Self {
        Self::on_broker(MockBroker::new())
    }

    /// Client on a broker shared with other clients
    pub fn on_broker(broker: Arc<MockBroker>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            client_id: broker.next_client_id.fetch_add(1, Ordering::SeqCst),
            broker,
            connected: AtomicBool::new(false),
            permanently_disconnected: AtomicBool::new(false),
            fail_connect: false,
            publish_calls: AtomicUsize::new(0),
            failing_publishes: std::sync::Mutex::new(Vec::new()),
            flush_failure: AtomicBool::new(false),
            events,
            metrics: ConnectionMetrics::new(),
        }
    }

    /// Transport whose connect attempts always time out
    pub fn with_failure() -> Self {
        Self {
            fail_connect: true,
            ..Self::new()
        }
    }

    pub fn broker(&self) -> Arc<MockBroker> {
        self.broker.clone()
    }

    /// Make the `index`-th publish call (0-based) fail
    pub fn fail_publish_at(&self, index: usize) {
        if let Ok(mut failing) = self.failing_publishes.lock() {
            failing.push(index);
        }
    }

    /// Make `flush` report a timeout
    pub fn set_flush_failure(&self, fail: bool) {
        self.flush_failure.store(fail, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.broker.published().await
    }

    pub async fn acks(&self) -> Vec<PublishedMessage> {
        self.broker.acks().await
    }

    pub async fn nacks(&self) -> Vec<PublishedMessage> {
        self.broker.nacks().await
    }

    pub async fn inject(&self, subject: &str, payload: impl Into<Vec<u8>>) {
        self.broker.inject(subject, payload.into()).await;
    }

    /// Drop the connection as a network failure would
    pub fn simulate_connection_loss(&self, permanent: bool) {
        self.connected.store(false, Ordering::SeqCst);
        self.metrics.disconnects.incr();
        let _ = self.events.send(TransportEvent::Disconnected {
            reason: "simulated".into(),
        });
        if permanent {
            self.permanently_disconnected.store(true, Ordering::SeqCst);
            let _ = self.events.send(TransportEvent::PermanentlyDisconnected {
                reason: "simulated".into(),
            });
        }
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, timeout: Duration) -> Result<(), TransportError> {
        if timeout.is_zero() {
            return Err(TransportError::InvalidTimeout);
        }
        if self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }
        if self.fail_connect {
            self.metrics.errors.incr();
            return Err(TransportError::ConnectionTimeout(timeout));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.metrics.connections.incr();
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self, _timeout: Duration) -> Result<(), TransportError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.remove_subscribers(self.client_id, None).await;
        self.metrics.disconnects.incr();
        let _ = self.events.send(TransportEvent::Disconnected {
            reason: "client disconnect".into(),
        });
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        validate_subject(subject)?;
        self.ensure_connected()?;

        let call = self.publish_calls.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failing_publishes
            .lock()
            .map(|failing| failing.contains(&call))
            .unwrap_or(false);
        if should_fail {
            self.metrics.errors.incr();
            return Err(TransportError::PublishFailed(format!(
                "mock failure on publish {call}"
            )));
        }

        self.broker
            .publish(&canonicalize_subject(subject), payload)
            .await;
        self.metrics.messages_published.incr();
        Ok(())
    }

    async fn flush(&self, timeout: Duration) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if self.flush_failure.load(Ordering::SeqCst) {
            return Err(TransportError::FlushTimeout(timeout));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, TransportError> {
        validate_subject(subject)?;
        self.ensure_connected()?;
        let subject = canonicalize_subject(subject);

        if self.broker.has_subscription(self.client_id, &subject).await {
            return Err(TransportError::AlreadySubscribed(subject));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.broker
            .add_subscriber(MockSubscriber {
                client_id: self.client_id,
                subject: subject.clone(),
                group: queue_group.map(str::to_string),
                sender,
            })
            .await;
        Ok(Subscription::new(subject, receiver))
    }

    async fn unsubscribe(&self, subject: &str) -> Result<(), TransportError> {
        self.broker
            .remove_subscribers(self.client_id, Some(&canonicalize_subject(subject)))
            .await;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn is_permanently_disconnected(&self) -> bool {
        self.permanently_disconnected.load(Ordering::SeqCst)
    }

    fn metrics(&self) -> Snapshot {
        self.metrics.snapshot()
    }
}

/// Mock LLM provider for testing
#[derive(Debug)]
pub struct MockLlmProvider {
    pub responses: Vec<String>,
    pub current_response: Arc<Mutex<usize>>,
    pub should_fail: bool,
    pub calls: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockLlmProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            current_response: Arc::new(Mutex::new(0)),
            should_fail: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Self::new(vec![])
        }
    }

    pub fn single_response(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    pub async fn get_calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.lock().await.push(request);
        if self.should_fail {
            return Err(LlmError::RequestFailed("Mock LLM failure".to_string()));
        }

        let mut current = self.current_response.lock().await;
        let response_idx = *current % self.responses.len().max(1);
        *current += 1;

        let content = self
            .responses
            .get(response_idx)
            .cloned()
            .unwrap_or_else(|| r#"{"drafts":[{"content":"Mock draft"}]}"#.to_string());

        Ok(CompletionResponse {
            content: Some(content),
            model: "mock-model".to_string(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            finish_reason: FinishReason::Stop,
        })
    }
}

/// Use case that replays a script of outcomes; the last one repeats once the
/// script runs out
pub struct MockUseCase {
    script: Vec<Result<Vec<String>, UseCaseError>>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<DraftRequest>>>,
}

impl MockUseCase {
    /// Outcomes in call order; `Ok` holds draft contents
    pub fn scripted(script: Vec<Result<Vec<String>, UseCaseError>>) -> Self {
        Self {
            script,
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding(contents: &[&str]) -> Self {
        Self::scripted(vec![Ok(contents.iter().map(|c| c.to_string()).collect())])
    }

    pub fn failing(error: UseCaseError) -> Self {
        Self::scripted(vec![Err(error)])
    }

    /// Fail `failures` times, then succeed with `contents`
    pub fn failing_then_succeeding(failures: usize, error: UseCaseError, contents: &[&str]) -> Self {
        let mut script: Vec<_> = (0..failures).map(|_| Err(error.clone())).collect();
        script.push(Ok(contents.iter().map(|c| c.to_string()).collect()));
        Self::scripted(script)
    }

    /// Sleep before answering, to exercise cancellation and deadlines
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn get_calls(&self) -> Vec<DraftRequest> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl GenerateDrafts for MockUseCase {
    async fn execute(&self, request: DraftRequest) -> Result<Vec<Draft>, UseCaseError> {
        let index = {
            let mut calls = self.calls.lock().await;
            calls.push(request.clone());
            calls.len() - 1
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self
            .script
            .get(index)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or_else(|| Err(UseCaseError::other("empty script")));

        outcome.map(|contents| {
            contents
                .into_iter()
                .map(|content| Draft::new(&request.user_id, &request.idea_id, content))
                .collect()
        })
    }
}

/// Message handler that returns a fixed result and records payloads
pub struct MockHandler {
    result: Result<(), HandlerError>,
    delay: Option<Duration>,
    payloads: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockHandler {
    pub fn ok() -> Self {
        Self::returning(Ok(()))
    }

    pub fn returning(result: Result<(), HandlerError>) -> Self {
        Self {
            result,
            delay: None,
            payloads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().await.clone()
    }
}

#[async_trait]
impl MessageHandler for MockHandler {
    async fn handle(&self, payload: &[u8], cancel: &CancellationToken) -> Result<(), HandlerError> {
        self.payloads.lock().await.push(payload.to_vec());
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(HandlerError::Retryable("cancelled".into())),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.result.clone()
    }
}

/// Job repository whose every call fails
#[derive(Debug, Default)]
pub struct FailingJobRepository;

#[async_trait]
impl JobRepository for FailingJobRepository {
    async fn find_by_id(&self, _job_id: &str) -> Result<Option<Job>, RepositoryError> {
        Err(RepositoryError::storage("mock storage unavailable"))
    }

    async fn update(&self, _job: &Job) -> Result<(), RepositoryError> {
        Err(RepositoryError::storage("mock storage unavailable"))
    }

    async fn update_if_status(
        &self,
        _job: &Job,
        _expected: JobStatus,
    ) -> Result<bool, RepositoryError> {
        Err(RepositoryError::storage("mock storage unavailable"))
    }
}

/// JobError repository whose every call fails
#[derive(Debug, Default)]
pub struct FailingJobErrorRepository;

#[async_trait]
impl JobErrorRepository for FailingJobErrorRepository {
    async fn create(&self, _record: &JobError) -> Result<String, RepositoryError> {
        Err(RepositoryError::storage("mock storage unavailable"))
    }
}
