//! At-least-once publisher bound to one subject

use crate::observability::metrics::{PublisherMetrics, Snapshot};
use crate::protocol::{canonicalize_subject, validate_subject, SubjectError};
use crate::transport::{Transport, TransportError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_BATCH_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Invalid subject: {0}")]
    InvalidSubject(#[from] SubjectError),
    #[error("Not connected")]
    NotConnected,
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("Publish cancelled")]
    Cancelled,
    #[error("Flush failed: {0}")]
    FlushFailed(String),
}

impl PublishError {
    fn from_transport(error: TransportError) -> Self {
        match error {
            TransportError::NotConnected => Self::NotConnected,
            TransportError::FlushTimeout(timeout) => Self::Timeout(timeout),
            other => Self::PublishFailed(other.to_string()),
        }
    }
}

/// Outcome of a best-effort batch; `skipped` messages were logged and dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub published: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    subject: String,
    ttl: Option<Duration>,
    batch_flush_timeout: Duration,
    metrics: Arc<PublisherMetrics>,
}

impl Publisher {
    pub fn new(transport: Arc<dyn Transport>, subject: &str) -> Result<Self, PublishError> {
        validate_subject(subject)?;
        Ok(Self {
            transport,
            subject: canonicalize_subject(subject),
            ttl: None,
            batch_flush_timeout: DEFAULT_BATCH_FLUSH_TIMEOUT,
            metrics: Arc::new(PublisherMetrics::new()),
        })
    }

    /// Informational TTL. Never enforced by the transport; consumers may interpret it.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_batch_flush_timeout(mut self, timeout: Duration) -> Self {
        self.batch_flush_timeout = timeout;
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn metrics(&self) -> Arc<PublisherMetrics> {
        self.metrics.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.metrics.snapshot()
    }

    /// Serialize and publish one message
    pub async fn publish<T: Serialize>(&self, message: &T) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(message).map_err(|e| {
            self.metrics.errors.incr();
            PublishError::Serialization(e)
        })?;
        self.publish_bytes(payload).await
    }

    /// Publish an already-encoded payload
    pub async fn publish_bytes(&self, payload: Vec<u8>) -> Result<(), PublishError> {
        if !self.transport.is_connected().await {
            self.metrics.errors.incr();
            return Err(PublishError::NotConnected);
        }

        match self.transport.publish(&self.subject, payload).await {
            Ok(()) => {
                self.metrics.published.incr();
                debug!(subject = %self.subject, ttl = ?self.ttl, "Message published");
                Ok(())
            }
            Err(e) => {
                self.metrics.errors.incr();
                Err(PublishError::from_transport(e))
            }
        }
    }

    /// Publish and wait for the broker to acknowledge it.
    ///
    /// Cancellation takes precedence over the timeout when both are ready.
    pub async fn publish_sync<T: Serialize>(
        &self,
        message: &T,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        if cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }
        let payload = serde_json::to_vec(message).map_err(|e| {
            self.metrics.errors.incr();
            PublishError::Serialization(e)
        })?;

        let publish_and_flush = async {
            self.publish_bytes(payload).await?;
            self.transport.flush(timeout).await.map_err(|e| {
                self.metrics.errors.incr();
                PublishError::from_transport(e)
            })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PublishError::Cancelled),
            result = tokio::time::timeout(timeout, publish_and_flush) => match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.metrics.errors.incr();
                    Err(PublishError::Timeout(timeout))
                }
            },
        }
    }

    /// Best-effort batch: individual failures are logged and skipped.
    ///
    /// Fails only when the final flush fails, so a partial batch is a normal outcome.
    pub async fn publish_batch<T: Serialize>(
        &self,
        messages: &[T],
    ) -> Result<BatchSummary, PublishError> {
        self.metrics.batches.incr();
        let mut summary = BatchSummary::default();

        for (index, message) in messages.iter().enumerate() {
            match self.publish(message).await {
                Ok(()) => summary.published += 1,
                Err(e) => {
                    warn!(subject = %self.subject, index, error = %e, "Skipping batch message");
                    summary.skipped += 1;
                }
            }
        }

        self.transport
            .flush(self.batch_flush_timeout)
            .await
            .map_err(|e| {
                self.metrics.errors.incr();
                PublishError::FlushFailed(e.to_string())
            })?;

        info!(
            subject = %self.subject,
            published = summary.published,
            skipped = summary.skipped,
            "Batch published"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockTransport;
    use serde_json::json;

    async fn connected() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        transport.connect(Duration::from_secs(1)).await.unwrap();
        transport
    }

    #[test]
    fn test_new_rejects_invalid_subject() {
        let transport = Arc::new(MockTransport::new());
        assert!(matches!(
            Publisher::new(transport.clone(), ""),
            Err(PublishError::InvalidSubject(SubjectError::Empty))
        ));
        assert!(Publisher::new(transport, "jobs/+").is_err());
    }

    #[tokio::test]
    async fn test_publish_not_connected() {
        let transport = Arc::new(MockTransport::new());
        let publisher = Publisher::new(transport, "jobs/drafts").unwrap();

        let result = publisher.publish(&json!({"a": 1})).await;

        assert!(matches!(result, Err(PublishError::NotConnected)));
        assert_eq!(publisher.snapshot()["errors"], 1);
        assert_eq!(publisher.snapshot()["published"], 0);
    }

    #[tokio::test]
    async fn test_publish_records_message() {
        // Arrange
        let transport = connected().await;
        let publisher = Publisher::new(transport.clone(), "/jobs/drafts/")
            .unwrap()
            .with_ttl(Duration::from_secs(60));

        // Act
        publisher.publish(&json!({"job_id": "j1"})).await.unwrap();

        // Assert
        let published = transport.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "jobs/drafts");
        assert_eq!(publisher.ttl(), Some(Duration::from_secs(60)));
        assert_eq!(publisher.snapshot()["published"], 1);
    }

    #[tokio::test]
    async fn test_publish_failure_wrapped() {
        let transport = connected().await;
        transport.fail_publish_at(0);
        let publisher = Publisher::new(transport, "jobs/drafts").unwrap();

        let result = publisher.publish(&json!({})).await;

        assert!(matches!(result, Err(PublishError::PublishFailed(_))));
        assert_eq!(publisher.snapshot()["errors"], 1);
    }

    #[tokio::test]
    async fn test_publish_sync_cancelled_first() {
        let transport = connected().await;
        let publisher = Publisher::new(transport.clone(), "jobs/drafts").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = publisher
            .publish_sync(&json!({}), Duration::from_secs(1), &cancel)
            .await;

        assert!(matches!(result, Err(PublishError::Cancelled)));
        assert!(transport.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_sync_flush_timeout() {
        let transport = connected().await;
        transport.set_flush_failure(true);
        let publisher = Publisher::new(transport, "jobs/drafts").unwrap();

        let result = publisher
            .publish_sync(
                &json!({}),
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(PublishError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_publish_batch_skips_failures() {
        // Arrange
        let transport = connected().await;
        transport.fail_publish_at(1);
        let publisher = Publisher::new(transport.clone(), "jobs/drafts").unwrap();
        let messages = vec![json!({"n": 0}), json!({"n": 1}), json!({"n": 2})];

        // Act
        let summary = publisher.publish_batch(&messages).await.unwrap();

        // Assert
        assert_eq!(
            summary,
            BatchSummary {
                published: 2,
                skipped: 1
            }
        );
        assert_eq!(transport.published().await.len(), 2);
        assert_eq!(publisher.snapshot()["batches"], 1);
    }

    #[tokio::test]
    async fn test_publish_batch_fails_only_on_flush() {
        let transport = connected().await;
        transport.set_flush_failure(true);
        let publisher = Publisher::new(transport.clone(), "jobs/drafts")
            .unwrap()
            .with_batch_flush_timeout(Duration::from_millis(10));

        let result = publisher.publish_batch(&[json!({"n": 0})]).await;

        assert!(matches!(result, Err(PublishError::FlushFailed(_))));
        assert_eq!(transport.published().await.len(), 1);
    }
}
