//! Transport layer for the job queue
//!
//! [`Transport`] abstracts the broker connection so the publisher, consumer
//! and worker can run against MQTT in production and an in-memory broker in
//! tests. Every inbound message is a [`Delivery`] that must be acknowledged
//! or negatively acknowledged exactly once; both consume the delivery.

use crate::observability::metrics::Snapshot;
use crate::protocol::SubjectError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

pub mod mqtt;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Invalid timeout: must be greater than zero")]
    InvalidTimeout,
    #[error("Connection timed out after {0:?}")]
    ConnectionTimeout(Duration),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid subject: {0}")]
    InvalidSubject(#[from] SubjectError),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Flush timed out after {0:?}")]
    FlushTimeout(Duration),
    #[error("Subscription failed: {0}")]
    SubscribeFailed(String),
    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),
    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),
}

/// Connection lifecycle notifications, broadcast without blocking the event loop
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Reconnected,
    Error { message: String },
    PermanentlyDisconnected { reason: String },
}

/// Settles one inbound message with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;

    /// Request redelivery of the message
    async fn nack(&self) -> Result<(), TransportError>;
}

/// One inbound message
pub struct Delivery {
    pub subject: String,
    pub payload: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(subject: String, payload: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            subject,
            payload,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    pub async fn nack(self) -> Result<(), TransportError> {
        self.acker.nack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Stream of deliveries for one subject.
///
/// Ends (yields `None`) once the transport unsubscribes and buffered
/// deliveries have been drained.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(subject: String, receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { subject, receiver }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

/// Broker connection used by the publisher and consumer.
///
/// All methods take `&self`; implementations guard connection state internally
/// so one transport can be shared behind an `Arc`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect, failing with `AlreadyConnected`, `InvalidTimeout` (zero) or
    /// `ConnectionTimeout`. Not retried internally.
    async fn connect(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Disconnect. No-op when not connected. A non-zero timeout drains
    /// outstanding work first; zero closes immediately.
    async fn disconnect(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Connected flag set and the broker is answering
    async fn is_connected(&self) -> bool;

    /// Publish with at-least-once delivery
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Wait until everything published so far has been acknowledged by the broker
    async fn flush(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Subscribe to `subject`, competing with other members of `queue_group` if given
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, TransportError>;

    /// Stop delivery for `subject`. No-op when not subscribed.
    async fn unsubscribe(&self, subject: &str) -> Result<(), TransportError>;

    /// Lifecycle events; slow receivers lose events rather than blocking the sender
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Reconnection gave up
    fn is_permanently_disconnected(&self) -> bool;

    fn metrics(&self) -> Snapshot;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingAcker {
        acks: Arc<AtomicU32>,
        nacks: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Acknowledger for CountingAcker {
        async fn ack(&self) -> Result<(), TransportError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nack(&self) -> Result<(), TransportError> {
            self.nacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delivery_settles_through_acker() {
        let acker = CountingAcker::default();
        let acks = acker.acks.clone();
        let nacks = acker.nacks.clone();

        Delivery::new("s".into(), b"a".to_vec(), Box::new(acker))
            .ack()
            .await
            .unwrap();

        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(nacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscription_drains_after_sender_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscription = Subscription::new("jobs".into(), rx);

        tx.send(Delivery::new(
            "jobs".into(),
            b"1".to_vec(),
            Box::new(CountingAcker::default()),
        ))
        .unwrap();
        drop(tx);

        assert_eq!(subscription.subject(), "jobs");
        assert!(subscription.next().await.is_some());
        assert!(subscription.next().await.is_none());
    }

    #[test]
    fn test_delivery_debug_hides_payload() {
        let delivery = Delivery::new(
            "jobs".into(),
            b"secret".to_vec(),
            Box::new(CountingAcker::default()),
        );
        let rendered = format!("{delivery:?}");
        assert!(rendered.contains("payload_len"));
        assert!(!rendered.contains("secret"));
    }
}
