//! Consumer integration tests against the in-memory broker
//!
//! Covers the ack/nack contract, redelivery bounded by `retry_count`,
//! dead-lettering, queue groups and drain semantics.

mod test_helpers;

use draft_pipeline::messaging::{Consumer, ConsumerError, HandlerError, Publisher};
use draft_pipeline::protocol::{DeadLetter, DeadLetterCode};
use draft_pipeline::testing::{MockBroker, MockHandler, MockTransport};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{
    connected_on, connected_transport, eventually, job_payload, retry_count_of,
    DEAD_LETTER_SUBJECT, SUBJECT,
};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_successful_handler_acknowledges() {
    // Arrange
    let transport = connected_transport().await;
    let consumer = Consumer::new(transport.clone(), SUBJECT, 3).unwrap();
    let handler = Arc::new(MockHandler::ok());
    consumer.subscribe(handler.clone()).await.unwrap();

    // Act
    transport.inject(SUBJECT, job_payload("j1", 0)).await;

    // Assert
    assert!(transport.broker().wait_for_settled(1, SETTLE_TIMEOUT).await);
    assert_eq!(transport.acks().await.len(), 1);
    assert!(transport.nacks().await.is_empty());
    assert_eq!(handler.payloads().await.len(), 1);

    let snapshot = consumer.snapshot();
    assert_eq!(snapshot["messages_received"], 1);
    assert_eq!(snapshot["messages_processed"], 1);
    assert_eq!(snapshot["acks"], 1);
}

#[tokio::test]
async fn test_retryable_failure_is_redelivered_until_max_retries() {
    // Arrange
    let transport = connected_transport().await;
    let dead_letters = Publisher::new(transport.clone(), DEAD_LETTER_SUBJECT).unwrap();
    let consumer = Consumer::new(transport.clone(), SUBJECT, 2)
        .unwrap()
        .with_dead_letter(dead_letters);
    let handler = Arc::new(MockHandler::returning(Err(HandlerError::Retryable(
        "llm unavailable".into(),
    ))));
    consumer.subscribe(handler.clone()).await.unwrap();

    // Act
    transport.inject(SUBJECT, job_payload("j1", 0)).await;

    // Assert: retry_count 0 and 1 are nacked, retry_count 2 is dropped
    assert!(transport.broker().wait_for_settled(3, SETTLE_TIMEOUT).await);
    let seen: Vec<u64> = handler
        .payloads()
        .await
        .iter()
        .map(|p| retry_count_of(p))
        .collect();
    assert_eq!(seen, vec![0, 1, 2]);
    assert_eq!(transport.nacks().await.len(), 2);
    assert_eq!(transport.acks().await.len(), 1);

    let broker = transport.broker();
    let b = &broker;
    assert!(
        eventually(SETTLE_TIMEOUT, || async move {
            b.published_to(DEAD_LETTER_SUBJECT).await.len() == 1
        })
        .await
    );
    let record: DeadLetter =
        serde_json::from_slice(&broker.published_to(DEAD_LETTER_SUBJECT).await[0]).unwrap();
    assert_eq!(record.subject, SUBJECT);
    assert_eq!(record.retry_count, 2);
    assert_eq!(record.error_code, DeadLetterCode::MaxRetriesExceeded);
    assert_eq!(record.payload["job_id"], "j1");

    let snapshot = consumer.snapshot();
    assert_eq!(snapshot["max_retries_reached"], 1);
    assert_eq!(snapshot["dead_lettered"], 1);
    assert_eq!(snapshot["processing_errors"], 3);
}

#[tokio::test]
async fn test_retry_count_at_limit_is_dropped_once() {
    let transport = connected_transport().await;
    let consumer = Consumer::new(transport.clone(), SUBJECT, 3).unwrap();
    let handler = Arc::new(MockHandler::returning(Err(HandlerError::Retryable(
        "still failing".into(),
    ))));
    consumer.subscribe(handler.clone()).await.unwrap();

    transport.inject(SUBJECT, job_payload("j1", 7)).await;

    assert!(transport.broker().wait_for_settled(1, SETTLE_TIMEOUT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.acks().await.len(), 1);
    assert!(transport.nacks().await.is_empty());
    assert_eq!(handler.payloads().await.len(), 1);
}

#[tokio::test]
async fn test_permanent_failure_is_acknowledged_and_dead_lettered() {
    let transport = connected_transport().await;
    let consumer = Consumer::new(transport.clone(), SUBJECT, 3)
        .unwrap()
        .with_dead_letter(Publisher::new(transport.clone(), DEAD_LETTER_SUBJECT).unwrap());
    consumer
        .subscribe(Arc::new(MockHandler::returning(Err(HandlerError::Permanent(
            "generation failed after 3 attempts".into(),
        )))))
        .await
        .unwrap();

    transport.inject(SUBJECT, job_payload("j1", 0)).await;

    assert!(transport.broker().wait_for_settled(1, SETTLE_TIMEOUT).await);
    assert!(transport.nacks().await.is_empty());
    let broker = transport.broker();
    let b = &broker;
    assert!(
        eventually(SETTLE_TIMEOUT, || async move {
            b.published_to(DEAD_LETTER_SUBJECT).await.len() == 1
        })
        .await
    );
    let record: DeadLetter =
        serde_json::from_slice(&broker.published_to(DEAD_LETTER_SUBJECT).await[0]).unwrap();
    assert_eq!(record.error_code, DeadLetterCode::PermanentFailure);
    assert_eq!(record.error, "generation failed after 3 attempts");
}

#[tokio::test]
async fn test_malformed_payload_acknowledged_without_calling_handler() {
    let transport = connected_transport().await;
    let consumer = Consumer::new(transport.clone(), SUBJECT, 3).unwrap();
    let handler = Arc::new(MockHandler::returning(Err(HandlerError::Retryable(
        "unused".into(),
    ))));
    consumer.subscribe(handler.clone()).await.unwrap();

    for payload in ["not json", "[1,2,3]", "\"just a string\""] {
        transport.inject(SUBJECT, payload).await;
    }

    assert!(transport.broker().wait_for_settled(3, SETTLE_TIMEOUT).await);
    assert_eq!(transport.acks().await.len(), 3);
    assert!(transport.nacks().await.is_empty());
    assert!(handler.payloads().await.is_empty());
    assert_eq!(consumer.snapshot()["processing_errors"], 3);
}

#[tokio::test]
async fn test_subscribe_rules() {
    let transport = connected_transport().await;
    let consumer = Consumer::new(transport.clone(), SUBJECT, 3).unwrap();

    consumer.subscribe(Arc::new(MockHandler::ok())).await.unwrap();
    assert!(consumer.is_subscribed().await);
    assert!(matches!(
        consumer.subscribe(Arc::new(MockHandler::ok())).await,
        Err(ConsumerError::AlreadySubscribed)
    ));

    let offline = Arc::new(MockTransport::new());
    let offline_consumer = Consumer::new(offline, SUBJECT, 3).unwrap();
    assert!(matches!(
        offline_consumer.subscribe(Arc::new(MockHandler::ok())).await,
        Err(ConsumerError::NotConnected)
    ));

    assert!(matches!(
        Consumer::new(transport, "jobs/+", 3),
        Err(ConsumerError::InvalidSubject(_))
    ));
}

#[tokio::test]
async fn test_queue_group_members_compete() {
    // Arrange
    let broker = MockBroker::new();
    let first = connected_on(broker.clone()).await;
    let second = connected_on(broker.clone()).await;
    let handler_a = Arc::new(MockHandler::ok());
    let handler_b = Arc::new(MockHandler::ok());
    let consumer_a = Consumer::new(first.clone(), SUBJECT, 3)
        .unwrap()
        .with_queue_group("draft-workers");
    let consumer_b = Consumer::new(second.clone(), SUBJECT, 3)
        .unwrap()
        .with_queue_group("draft-workers");
    consumer_a.subscribe(handler_a.clone()).await.unwrap();
    consumer_b.subscribe(handler_b.clone()).await.unwrap();

    // Act
    for n in 0..6 {
        broker.inject(SUBJECT, job_payload(&format!("j{n}"), 0)).await;
    }

    // Assert: every message handled exactly once across the group
    assert!(broker.wait_for_settled(6, SETTLE_TIMEOUT).await);
    let a = handler_a.payloads().await.len();
    let b = handler_b.payloads().await.len();
    assert_eq!(a + b, 6);
    assert_eq!(a, 3);
}

#[tokio::test]
async fn test_drain_unsubscribe_finishes_in_flight() {
    let transport = connected_transport().await;
    let consumer = Consumer::new(transport.clone(), SUBJECT, 3).unwrap();
    let handler = Arc::new(MockHandler::ok().with_delay(Duration::from_millis(100)));
    consumer.subscribe(handler.clone()).await.unwrap();

    transport.inject(SUBJECT, job_payload("j1", 0)).await;
    let h = &handler;
    assert!(eventually(SETTLE_TIMEOUT, || async move { h.payloads().await.len() == 1 }).await);

    consumer.unsubscribe(Duration::from_secs(2)).await.unwrap();

    assert!(!consumer.is_subscribed().await);
    assert_eq!(transport.acks().await.len(), 1);
    assert!(transport.nacks().await.is_empty());
}

#[tokio::test]
async fn test_hard_unsubscribe_cancels_handlers() {
    let transport = connected_transport().await;
    transport.broker().set_redeliver_on_nack(false);
    let consumer = Consumer::new(transport.clone(), SUBJECT, 3).unwrap();
    let handler = Arc::new(MockHandler::ok().with_delay(Duration::from_secs(30)));
    consumer.subscribe(handler.clone()).await.unwrap();

    transport.inject(SUBJECT, job_payload("j1", 0)).await;
    let h = &handler;
    assert!(eventually(SETTLE_TIMEOUT, || async move { h.payloads().await.len() == 1 }).await);

    consumer.unsubscribe(Duration::ZERO).await.unwrap();

    // The cancelled handler reports a retryable error, so the message goes back
    assert!(transport.broker().wait_for_settled(1, SETTLE_TIMEOUT).await);
    assert_eq!(transport.nacks().await.len(), 1);
}

#[tokio::test]
async fn test_unsubscribe_when_not_subscribed_is_noop() {
    let transport = connected_transport().await;
    let consumer = Consumer::new(transport, SUBJECT, 3).unwrap();
    consumer.unsubscribe(Duration::from_secs(1)).await.unwrap();
    consumer.unsubscribe(Duration::ZERO).await.unwrap();
}
