//! Publisher to consumer round trips over the in-memory broker

mod test_helpers;

use draft_pipeline::messaging::{Consumer, PublishError, Publisher};
use draft_pipeline::protocol::DraftJobMessage;
use draft_pipeline::testing::{MockBroker, MockHandler};
use draft_pipeline::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{connected_on, connected_transport, SUBJECT};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_published_envelope_reaches_consumer() {
    // Arrange: producer and worker on separate connections to one broker
    let broker = MockBroker::new();
    let producer = connected_on(broker.clone()).await;
    let worker_side = connected_on(broker.clone()).await;
    let consumer = Consumer::new(worker_side.clone(), SUBJECT, 3).unwrap();
    let handler = Arc::new(MockHandler::ok());
    consumer.subscribe(handler.clone()).await.unwrap();
    let publisher = Publisher::new(producer.clone(), SUBJECT).unwrap();
    let message = DraftJobMessage::new("job-1", "user-1", "idea-1");

    // Act
    publisher.publish(&message).await.unwrap();

    // Assert
    assert!(broker.wait_for_settled(1, Duration::from_secs(2)).await);
    let payloads = handler.payloads().await;
    assert_eq!(payloads.len(), 1);
    let received = DraftJobMessage::decode(&payloads[0]).unwrap();
    assert_eq!(received, message);
    assert_eq!(received.retry_count, 0);
}

#[tokio::test]
async fn test_publish_sync_succeeds_when_connected() {
    let transport = connected_transport().await;
    let publisher = Publisher::new(transport.clone(), "/jobs//draft-generation/").unwrap();
    assert_eq!(publisher.subject(), SUBJECT);

    publisher
        .publish_sync(
            &DraftJobMessage::new("job-1", "user-1", "idea-1"),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let published = transport.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, SUBJECT);
    assert_eq!(publisher.snapshot()["published"], 1);
}

#[tokio::test]
async fn test_publish_after_disconnect_is_not_connected() {
    let transport = connected_transport().await;
    let publisher = Publisher::new(transport.clone(), SUBJECT).unwrap();
    transport.disconnect(Duration::from_secs(1)).await.unwrap();

    let result = publisher
        .publish(&DraftJobMessage::new("job-1", "user-1", "idea-1"))
        .await;

    assert!(matches!(result, Err(PublishError::NotConnected)));
    assert_eq!(publisher.snapshot()["errors"], 1);
}

#[tokio::test]
async fn test_batch_is_partial_on_individual_failures() {
    let transport = connected_transport().await;
    transport.fail_publish_at(0);
    transport.fail_publish_at(3);
    let publisher = Publisher::new(transport.clone(), SUBJECT).unwrap();
    let messages: Vec<_> = (0..5)
        .map(|n| DraftJobMessage::new(format!("job-{n}"), "user-1", "idea-1"))
        .collect();

    let summary = publisher.publish_batch(&messages).await.unwrap();

    assert_eq!(summary.published, 3);
    assert_eq!(summary.skipped, 2);
    let job_ids: Vec<String> = transport
        .published()
        .await
        .iter()
        .map(|(_, payload)| DraftJobMessage::decode(payload).unwrap().job_id)
        .collect();
    assert_eq!(job_ids, vec!["job-1", "job-2", "job-4"]);
}

#[tokio::test]
async fn test_ttl_is_informational() {
    let transport = connected_transport().await;
    let publisher = Publisher::new(transport.clone(), SUBJECT)
        .unwrap()
        .with_ttl(Duration::from_secs(60));

    publisher
        .publish(&DraftJobMessage::new("job-1", "user-1", "idea-1"))
        .await
        .unwrap();

    assert_eq!(publisher.ttl(), Some(Duration::from_secs(60)));
    let payload = &transport.published().await[0].1;
    let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
    assert!(value.get("ttl").is_none());
}
