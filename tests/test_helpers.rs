//! Test helpers and utilities for integration tests

#![allow(dead_code)]

use draft_pipeline::config::{LlmSection, MqttSection, QueueSection, WorkerConfig, WorkerSection};
use draft_pipeline::testing::{MockBroker, MockTransport};
use draft_pipeline::transport::Transport;
use std::sync::Arc;
use std::time::Duration;

pub const SUBJECT: &str = "jobs/draft-generation";
pub const DEAD_LETTER_SUBJECT: &str = "jobs/draft-generation/dead-letter";

/// Create a test configuration for integration tests
#[allow(dead_code)]
pub fn test_config() -> WorkerConfig {
    WorkerConfig {
        worker: WorkerSection {
            id: "test-worker".to_string(),
            max_retries: 2,
            processing_timeout_secs: 30,
        },
        mqtt: MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
            connect_timeout_secs: 5,
            drain_timeout_secs: 1,
            max_reconnect_attempts: None,
        },
        queue: QueueSection {
            subject: SUBJECT.to_string(),
            queue_group: Some("draft-workers".to_string()),
            max_redeliveries: 3,
            dead_letter_subject: Some(DEAD_LETTER_SUBJECT.to_string()),
            ttl_secs: None,
            max_in_flight: 4,
        },
        llm: LlmSection {
            base_url: "http://localhost:9".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            system_prompt: "You write LinkedIn posts.".to_string(),
            prompt_template: "Drafts for {idea_id} by {user_id}".to_string(),
            temperature: Some(0.7),
            max_tokens: Some(500),
            timeout_secs: 5,
        },
    }
}

/// Connected mock transport on a fresh broker
#[allow(dead_code)]
pub async fn connected_transport() -> Arc<MockTransport> {
    connected_on(MockBroker::new()).await
}

/// Connected mock transport on a shared broker
#[allow(dead_code)]
pub async fn connected_on(broker: Arc<MockBroker>) -> Arc<MockTransport> {
    let transport = Arc::new(MockTransport::on_broker(broker));
    transport
        .connect(Duration::from_secs(1))
        .await
        .expect("mock connect should succeed");
    transport
}

/// Valid job envelope as raw JSON
#[allow(dead_code)]
pub fn job_payload(job_id: &str, retry_count: u32) -> Vec<u8> {
    serde_json::json!({
        "job_id": job_id,
        "user_id": "user-1",
        "idea_id": "idea-1",
        "timestamp": "2024-05-01T10:00:00Z",
        "retry_count": retry_count,
    })
    .to_string()
    .into_bytes()
}

/// `retry_count` of a raw payload, 0 when absent
#[allow(dead_code)]
pub fn retry_count_of(payload: &[u8]) -> u64 {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v["retry_count"].as_u64())
        .unwrap_or(0)
}

/// Poll until `condition` holds or `timeout` elapses
#[allow(dead_code)]
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition().await
}
