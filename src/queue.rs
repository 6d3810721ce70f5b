//! Task queue capability.
//!
//! Upload enqueues one [`IngestionTask`] per accepted document; the worker
//! receives deliveries, acks on success, and nacks (with a backoff delay)
//! on transient failure so the queue redelivers. A delivery that is never
//! acked nor nacked reappears after the visibility window, which is what
//! makes a worker crash recoverable.
//!
//! The production adapter speaks the SQS JSON protocol over plain HTTPS
//! with SigV4 signing; the in-memory adapter models visibility timeouts
//! closely enough for the pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::aws::{AwsCredentials, SigningRequest};
use crate::config::QueueConfig;
use crate::models::IngestionTask;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue request timed out")]
    Timeout,
    #[error("queue service error: {0}")]
    Service(String),
    #[error("queue auth error: {0}")]
    Auth(String),
}

/// One received message: the parsed task plus what the worker needs to
/// settle it.
pub struct Delivery {
    pub task: IngestionTask,
    /// How many times this message has been delivered, this one included.
    pub receive_count: u32,
    /// Opaque settlement token; valid until the visibility window lapses.
    pub handle: String,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: &IngestionTask) -> Result<(), QueueError>;

    /// Poll for the next task. `Ok(None)` means the queue was empty for
    /// the duration of one poll.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Settle a delivery as done; the message is gone for good.
    async fn ack(&self, handle: &str) -> Result<(), QueueError>;

    /// Hand a delivery back for redelivery after `delay_secs`.
    async fn nack(&self, handle: &str, delay_secs: u64) -> Result<(), QueueError>;

    /// Connectivity probe for health reporting.
    async fn ping(&self) -> bool;
}

// ============ In-memory adapter ============

struct Pending {
    task: IngestionTask,
    receive_count: u32,
    available_at: Instant,
}

struct InFlight {
    task: IngestionTask,
    receive_count: u32,
    visible_at: Instant,
}

struct QueueState {
    ready: VecDeque<Pending>,
    inflight: HashMap<String, InFlight>,
}

/// In-memory queue for tests, with real visibility semantics: an unsettled
/// delivery returns to the ready list once its window lapses.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    visibility: Duration,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_visibility(Duration::from_secs(30))
    }

    pub fn with_visibility(visibility: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                inflight: HashMap::new(),
            }),
            visibility,
        }
    }

    /// Move lapsed in-flight deliveries back to the ready list.
    fn reclaim(state: &mut QueueState, now: Instant) {
        let lapsed: Vec<String> = state
            .inflight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(h, _)| h.clone())
            .collect();
        for handle in lapsed {
            if let Some(f) = state.inflight.remove(&handle) {
                state.ready.push_back(Pending {
                    task: f.task,
                    receive_count: f.receive_count,
                    available_at: now,
                });
            }
        }
    }

    pub fn depth(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.ready.len() + state.inflight.len()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: &IngestionTask) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.ready.push_back(Pending {
            task: task.clone(),
            receive_count: 0,
            available_at: Instant::now(),
        });
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        Self::reclaim(&mut state, now);

        let idx = state.ready.iter().position(|p| p.available_at <= now);
        let Some(idx) = idx else {
            return Ok(None);
        };
        let pending = state.ready.remove(idx).unwrap();

        let handle = Uuid::new_v4().to_string();
        let receive_count = pending.receive_count + 1;
        state.inflight.insert(
            handle.clone(),
            InFlight {
                task: pending.task.clone(),
                receive_count,
                visible_at: now + self.visibility,
            },
        );

        Ok(Some(Delivery {
            task: pending.task,
            receive_count,
            handle,
        }))
    }

    async fn ack(&self, handle: &str) -> Result<(), QueueError> {
        self.state.lock().unwrap().inflight.remove(handle);
        Ok(())
    }

    async fn nack(&self, handle: &str, delay_secs: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if let Some(f) = state.inflight.remove(handle) {
            state.ready.push_back(Pending {
                task: f.task,
                receive_count: f.receive_count,
                available_at: Instant::now() + Duration::from_secs(delay_secs),
            });
        }
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}

// ============ SQS adapter ============

#[derive(Deserialize)]
struct ReceiveMessageResponse {
    #[serde(rename = "Messages", default)]
    messages: Vec<SqsMessage>,
}

#[derive(Deserialize)]
struct SqsMessage {
    #[serde(rename = "Body")]
    body: String,
    #[serde(rename = "ReceiptHandle")]
    receipt_handle: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

/// Production queue adapter: SQS over its JSON protocol
/// (`x-amz-target: AmazonSQS.<Action>`, `application/x-amz-json-1.0`).
pub struct SqsQueue {
    config: QueueConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
    /// Scheme + host of the queue endpoint, e.g. `https://sqs.us-east-1.amazonaws.com`.
    endpoint: String,
    host: String,
}

impl SqsQueue {
    pub fn new(config: &QueueConfig) -> Result<Self, QueueError> {
        let creds = AwsCredentials::from_env().map_err(|e| QueueError::Auth(e.to_string()))?;

        let (endpoint, host) = endpoint_of(&config.queue_url)
            .ok_or_else(|| QueueError::Service(format!("invalid queue URL: {}", config.queue_url)))?;

        // Long polling holds the connection open for wait_secs, so the
        // client timeout must sit comfortably above it.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.wait_secs + 10))
            .build()
            .map_err(|e| QueueError::Service(e.to_string()))?;

        Ok(Self {
            config: config.clone(),
            creds,
            client,
            endpoint,
            host,
        })
    }

    async fn call(&self, action: &str, body: serde_json::Value) -> Result<String, QueueError> {
        let payload = serde_json::to_vec(&body).map_err(|e| QueueError::Service(e.to_string()))?;
        let target = format!("AmazonSQS.{}", action);
        let extra = [
            (
                "content-type".to_string(),
                "application/x-amz-json-1.0".to_string(),
            ),
            ("x-amz-target".to_string(), target),
        ];

        let headers = crate::aws::sign(
            &self.creds,
            &SigningRequest {
                method: "POST",
                host: &self.host,
                canonical_uri: "/",
                canonical_query: "",
                extra_headers: &extra,
                payload: &payload,
                region: &self.config.region,
                service: "sqs",
            },
        );

        let mut req = self.client.post(format!("{}/", self.endpoint)).body(payload);
        for (name, value) in &headers {
            req = req.header(name, value);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                QueueError::Timeout
            } else {
                QueueError::Service(e.to_string())
            }
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| QueueError::Service(e.to_string()))?;
        if !status.is_success() {
            return Err(QueueError::Service(format!(
                "{} failed (HTTP {}): {}",
                action,
                status,
                text.chars().take(300).collect::<String>()
            )));
        }
        Ok(text)
    }
}

/// Split an SQS queue URL into (scheme+host, host).
fn endpoint_of(queue_url: &str) -> Option<(String, String)> {
    let rest = queue_url
        .strip_prefix("https://")
        .or_else(|| queue_url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?.to_string();
    let scheme_len = queue_url.len() - rest.len();
    Some((format!("{}{}", &queue_url[..scheme_len], host), host))
}

#[async_trait]
impl TaskQueue for SqsQueue {
    async fn enqueue(&self, task: &IngestionTask) -> Result<(), QueueError> {
        let body = serde_json::to_string(task).map_err(|e| QueueError::Service(e.to_string()))?;
        self.call(
            "SendMessage",
            serde_json::json!({
                "QueueUrl": self.config.queue_url,
                "MessageBody": body,
            }),
        )
        .await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let text = self
            .call(
                "ReceiveMessage",
                serde_json::json!({
                    "QueueUrl": self.config.queue_url,
                    "MaxNumberOfMessages": 1,
                    "WaitTimeSeconds": self.config.wait_secs,
                    "VisibilityTimeout": self.config.visibility_secs,
                    "AttributeNames": ["ApproximateReceiveCount"],
                }),
            )
            .await?;

        let parsed: ReceiveMessageResponse =
            serde_json::from_str(&text).map_err(|e| QueueError::Service(e.to_string()))?;
        let Some(message) = parsed.messages.into_iter().next() else {
            return Ok(None);
        };

        let receive_count = message
            .attributes
            .get("ApproximateReceiveCount")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        let task: IngestionTask = match serde_json::from_str(&message.body) {
            Ok(task) => task,
            Err(e) => {
                // A body we cannot parse will never parse; drop it rather
                // than let it cycle through the queue forever.
                tracing::warn!(error = %e, "dropping malformed queue message");
                self.ack(&message.receipt_handle).await?;
                return Ok(None);
            }
        };

        Ok(Some(Delivery {
            task,
            receive_count,
            handle: message.receipt_handle,
        }))
    }

    async fn ack(&self, handle: &str) -> Result<(), QueueError> {
        self.call(
            "DeleteMessage",
            serde_json::json!({
                "QueueUrl": self.config.queue_url,
                "ReceiptHandle": handle,
            }),
        )
        .await?;
        Ok(())
    }

    async fn nack(&self, handle: &str, delay_secs: u64) -> Result<(), QueueError> {
        // SQS caps visibility at 12 hours; the worker's backoff never gets
        // anywhere near that, but clamp anyway.
        let delay = delay_secs.min(43_200);
        self.call(
            "ChangeMessageVisibility",
            serde_json::json!({
                "QueueUrl": self.config.queue_url,
                "ReceiptHandle": handle,
                "VisibilityTimeout": delay,
            }),
        )
        .await?;
        Ok(())
    }

    async fn ping(&self) -> bool {
        self.call(
            "GetQueueAttributes",
            serde_json::json!({
                "QueueUrl": self.config.queue_url,
                "AttributeNames": ["QueueArn"],
            }),
        )
        .await
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Document;

    fn task() -> IngestionTask {
        IngestionTask::new(Document {
            id: Uuid::new_v4(),
            filename: "a.txt".to_string(),
            media_type: "text/plain".to_string(),
            size_bytes: 5,
            storage_key: "uploads/a.txt".to_string(),
        })
    }

    #[tokio::test]
    async fn receive_then_ack_empties_the_queue() {
        let queue = MemoryQueue::new();
        queue.enqueue(&task()).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.receive_count, 1);
        queue.ack(&delivery.handle).await.unwrap();

        assert!(queue.receive().await.unwrap().is_none());
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn nack_redelivers_with_incremented_count() {
        let queue = MemoryQueue::new();
        queue.enqueue(&task()).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        queue.nack(&first.handle, 0).await.unwrap();

        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.receive_count, 2);
        assert_eq!(second.task.document.id, first.task.document.id);
    }

    #[tokio::test]
    async fn unsettled_delivery_reappears_after_visibility_lapses() {
        let queue = MemoryQueue::with_visibility(Duration::ZERO);
        queue.enqueue(&task()).await.unwrap();

        // Received but never acked, as if the worker crashed mid-task.
        let lost = queue.receive().await.unwrap().unwrap();
        drop(lost);

        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.receive_count, 2);
    }

    #[tokio::test]
    async fn invisible_delivery_is_not_redelivered_early() {
        let queue = MemoryQueue::with_visibility(Duration::from_secs(300));
        queue.enqueue(&task()).await.unwrap();

        let _held = queue.receive().await.unwrap().unwrap();
        assert!(queue.receive().await.unwrap().is_none());
    }

    #[test]
    fn endpoint_of_splits_queue_url() {
        let (endpoint, host) =
            endpoint_of("https://sqs.us-east-1.amazonaws.com/123456789012/ragpipe-ingest").unwrap();
        assert_eq!(endpoint, "https://sqs.us-east-1.amazonaws.com");
        assert_eq!(host, "sqs.us-east-1.amazonaws.com");
    }
}
