//! At-least-once consumer with bounded broker-level retries
//!
//! Each delivery is dispatched to the handler on its own task, bounded by a
//! semaphore. The ack/nack decision depends on the handler's outcome and the
//! payload's `retry_count`:
//!
//! | outcome | retry_count | action |
//! |---|---|---|
//! | malformed JSON | - | ack, count processing error |
//! | `Ok` | - | ack |
//! | `Retryable` | `< max_retries` | nack (redelivered) |
//! | `Retryable` | `>= max_retries` | ack, dead-letter |
//! | `Permanent` | - | ack, dead-letter |

use super::publisher::Publisher;
use crate::observability::metrics::{ConsumerMetrics, Snapshot};
use crate::protocol::{
    canonicalize_subject, read_retry_count, validate_subject, DeadLetter, DeadLetterCode,
    SubjectError,
};
use crate::transport::{Delivery, Transport, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// How a handler failed; decides between redelivery and dropping
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(message) | Self::Permanent(message) => message,
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one raw payload. `cancel` fires on hard unsubscribe or shutdown.
    async fn handle(&self, payload: &[u8], cancel: &CancellationToken) -> Result<(), HandlerError>;
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Invalid subject: {0}")]
    InvalidSubject(#[from] SubjectError),
    #[error("Already subscribed")]
    AlreadySubscribed,
    #[error("Not connected")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// What to do with a delivery once its payload and handler outcome are known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack,
    /// Retry budget spent; ack and dead-letter
    MaxRetriesReached,
    /// Handler said the message can never succeed; ack and dead-letter
    Rejected,
}

/// Pure ack/nack classification
pub fn classify(
    outcome: &Result<(), HandlerError>,
    retry_count: u32,
    max_retries: u32,
) -> Disposition {
    match outcome {
        Ok(()) => Disposition::Ack,
        Err(HandlerError::Permanent(_)) => Disposition::Rejected,
        Err(HandlerError::Retryable(_)) if retry_count < max_retries => Disposition::Nack,
        Err(HandlerError::Retryable(_)) => Disposition::MaxRetriesReached,
    }
}

struct ActiveSubscription {
    dispatcher: JoinHandle<()>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

struct Dispatch {
    subject: String,
    max_retries: u32,
    handler: Arc<dyn MessageHandler>,
    dead_letter: Option<Publisher>,
    metrics: Arc<ConsumerMetrics>,
    cancel: CancellationToken,
}

pub struct Consumer {
    transport: Arc<dyn Transport>,
    subject: String,
    queue_group: Option<String>,
    max_retries: u32,
    max_in_flight: usize,
    dead_letter: Option<Publisher>,
    metrics: Arc<ConsumerMetrics>,
    active: Mutex<Option<ActiveSubscription>>,
}

impl Consumer {
    pub fn new(
        transport: Arc<dyn Transport>,
        subject: &str,
        max_retries: u32,
    ) -> Result<Self, ConsumerError> {
        validate_subject(subject)?;
        Ok(Self {
            transport,
            subject: canonicalize_subject(subject),
            queue_group: None,
            max_retries,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            dead_letter: None,
            metrics: Arc::new(ConsumerMetrics::new()),
            active: Mutex::new(None),
        })
    }

    /// Compete with other members of `group` for each message
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Forward dropped messages to `publisher` instead of discarding them
    pub fn with_dead_letter(mut self, publisher: Publisher) -> Self {
        self.dead_letter = Some(publisher);
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        self.metrics.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.metrics.snapshot()
    }

    pub async fn is_subscribed(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Start dispatching deliveries to `handler`
    pub async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<(), ConsumerError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(ConsumerError::AlreadySubscribed);
        }
        if !self.transport.is_connected().await {
            return Err(ConsumerError::NotConnected);
        }

        let mut subscription = self
            .transport
            .subscribe(&self.subject, self.queue_group.as_deref())
            .await
            .map_err(|e| match e {
                TransportError::NotConnected => ConsumerError::NotConnected,
                other => ConsumerError::Transport(other),
            })?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let dispatch = Arc::new(Dispatch {
            subject: self.subject.clone(),
            max_retries: self.max_retries,
            handler,
            dead_letter: self.dead_letter.clone(),
            metrics: self.metrics.clone(),
            cancel: cancel.clone(),
        });

        let loop_tracker = tracker.clone();
        let loop_cancel = cancel.clone();
        let dispatcher = tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    next = subscription.next() => match next {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };

                let permit = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let dispatch = dispatch.clone();
                loop_tracker.spawn(async move {
                    dispatch.process(delivery).await;
                    drop(permit);
                });
            }
            debug!(subject = %dispatch.subject, "Dispatch loop stopped");
        });

        *active = Some(ActiveSubscription {
            dispatcher,
            tracker,
            cancel,
        });
        info!(
            subject = %self.subject,
            queue_group = ?self.queue_group,
            max_retries = self.max_retries,
            "Consumer subscribed"
        );
        Ok(())
    }

    /// Stop consuming. No-op when not subscribed.
    ///
    /// A positive `drain_timeout` stops new deliveries and lets in-flight and
    /// buffered messages finish (bounded by the timeout); zero cancels immediately.
    pub async fn unsubscribe(&self, drain_timeout: Duration) -> Result<(), ConsumerError> {
        let Some(mut active) = self.active.lock().await.take() else {
            return Ok(());
        };

        let unsubscribed = self.transport.unsubscribe(&self.subject).await;

        if drain_timeout.is_zero() {
            active.cancel.cancel();
            active.dispatcher.abort();
        } else {
            let deadline = tokio::time::Instant::now() + drain_timeout;
            let drained = async {
                let _ = (&mut active.dispatcher).await;
                active.tracker.close();
                active.tracker.wait().await;
            };
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                warn!(subject = %self.subject, "Drain timed out, cancelling in-flight handlers");
                active.cancel.cancel();
                active.dispatcher.abort();
            }
        }
        active.tracker.close();

        info!(subject = %self.subject, drained = !drain_timeout.is_zero(), "Consumer unsubscribed");
        unsubscribed.map_err(ConsumerError::from)
    }
}

impl Dispatch {
    async fn process(&self, delivery: Delivery) {
        self.metrics.messages_received.incr();
        let span = tracing::info_span!("consume", subject = %self.subject);

        async {
            let retry_count = match read_retry_count(&delivery.payload) {
                Ok(count) => count,
                Err(e) => {
                    warn!(error = %e, "Malformed payload, acknowledging without retry");
                    self.metrics.processing_errors.incr();
                    self.settle(delivery, Disposition::Ack).await;
                    return;
                }
            };

            let outcome = self.handler.handle(&delivery.payload, &self.cancel).await;
            let disposition = classify(&outcome, retry_count, self.max_retries);

            match &outcome {
                Ok(()) => self.metrics.messages_processed.incr(),
                Err(e) => {
                    self.metrics.processing_errors.incr();
                    debug!(retry_count, error = %e, ?disposition, "Handler failed");
                }
            }

            if let Err(handler_error) = &outcome {
                match disposition {
                    Disposition::MaxRetriesReached => {
                        self.metrics.max_retries_reached.incr();
                        warn!(
                            retry_count,
                            max_retries = self.max_retries,
                            error = %handler_error,
                            "Max retries reached, dropping message"
                        );
                        self.dead_letter(
                            &delivery,
                            handler_error,
                            DeadLetterCode::MaxRetriesExceeded,
                            retry_count,
                        )
                        .await;
                    }
                    Disposition::Rejected => {
                        warn!(error = %handler_error, "Permanent failure, dropping message");
                        self.dead_letter(
                            &delivery,
                            handler_error,
                            DeadLetterCode::PermanentFailure,
                            retry_count,
                        )
                        .await;
                    }
                    Disposition::Ack | Disposition::Nack => {}
                }
            }

            self.settle(delivery, disposition).await;
        }
        .instrument(span)
        .await
    }

    async fn settle(&self, delivery: Delivery, disposition: Disposition) {
        let result = match disposition {
            Disposition::Nack => {
                self.metrics.nacks.incr();
                delivery.nack().await
            }
            Disposition::Ack | Disposition::MaxRetriesReached | Disposition::Rejected => {
                self.metrics.acks.incr();
                delivery.ack().await
            }
        };
        if let Err(e) = result {
            error!(error = %e, ?disposition, "Failed to settle delivery");
        }
    }

    /// Best effort; a failure here never changes the ack decision
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        handler_error: &HandlerError,
        code: DeadLetterCode,
        retry_count: u32,
    ) {
        let Some(publisher) = &self.dead_letter else {
            return;
        };
        let record = DeadLetter::new(
            &delivery.subject,
            &delivery.payload,
            handler_error.message(),
            code,
            retry_count,
        );
        match publisher.publish(&record).await {
            Ok(()) => {
                self.metrics.dead_lettered.incr();
                info!(dead_letter_subject = %publisher.subject(), ?code, "Message dead-lettered");
            }
            Err(e) => error!(error = %e, "Failed to publish dead letter"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn retryable() -> Result<(), HandlerError> {
        Err(HandlerError::Retryable("llm down".into()))
    }

    #[test]
    fn test_classify_table() {
        assert_eq!(classify(&Ok(()), 7, 3), Disposition::Ack);
        assert_eq!(classify(&retryable(), 0, 3), Disposition::Nack);
        assert_eq!(classify(&retryable(), 2, 3), Disposition::Nack);
        assert_eq!(classify(&retryable(), 3, 3), Disposition::MaxRetriesReached);
        assert_eq!(
            classify(&Err(HandlerError::Permanent("bad".into())), 0, 3),
            Disposition::Rejected
        );
        assert_eq!(classify(&retryable(), 0, 0), Disposition::MaxRetriesReached);
    }

    proptest! {
        #[test]
        fn retryable_below_limit_is_never_dropped(max in 1u32..50, offset in 1u32..50) {
            let retry_count = max.saturating_sub(offset.min(max));
            prop_assert_eq!(classify(&retryable(), retry_count, max), Disposition::Nack);
        }

        #[test]
        fn retryable_at_or_over_limit_is_dropped(max in 0u32..50, extra in 0u32..50) {
            prop_assert_eq!(
                classify(&retryable(), max + extra, max),
                Disposition::MaxRetriesReached
            );
        }

        #[test]
        fn success_always_acks(retry_count in any::<u32>(), max in any::<u32>()) {
            prop_assert_eq!(classify(&Ok(()), retry_count, max), Disposition::Ack);
        }
    }

    #[test]
    fn test_handler_error_message() {
        assert_eq!(HandlerError::Permanent("x".into()).message(), "x");
        assert_eq!(HandlerError::Retryable("y".into()).to_string(), "retryable: y");
    }
}
