//! Outbound messaging seam for remote task dispatch and interrupt fan-out.
//!
//! The engine never blocks on remote work: it serializes an envelope, hands
//! it to the [`Transport`], records the suspension, and returns. Responses
//! come back through the engine's inbound path keyed by correlation id.
//!
//! [`InMemoryTransport`] backs every topic with a flume channel, which
//! preserves publish order per topic (and therefore per key) — tests drain
//! it to observe exactly what the engine sent.

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ambiance::Ambiance;
use crate::executions::ExecutableResponse;
use crate::interrupts::InterruptType;
use crate::status::Status;
use crate::steps::{FailureInfo, OutcomePublish, StepResponse};

/// Topic carrying task requests to remote workers.
pub const TOPIC_TASKS: &str = "planwright.tasks";
/// Topic carrying cooperative interrupt notifications to remote workers.
pub const TOPIC_INTERRUPTS: &str = "planwright.interrupts";

/// A unit of remote work, published once per Task round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub correlation_id: String,
    /// 0-based round number; always 0 for plain Task mode, incremented per
    /// `DispatchNext` for TaskChain.
    pub round: u32,
    pub node_execution_id: String,
    pub step_type: String,
    pub parameters: Value,
    pub ambiance: Ambiance,
}

/// A remote worker's answer to a [`TaskRequest`], matched by correlation id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub correlation_id: String,
    pub status: Status,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcomes: Vec<OutcomePublish>,
    /// Worker-defined progress blob carried between TaskChain rounds.
    #[serde(default)]
    pub partial_progress: Option<Value>,
}

impl TaskResponse {
    #[must_use]
    pub fn succeeded(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: Status::Succeeded,
            failure_info: None,
            outcomes: Vec::new(),
            partial_progress: None,
        }
    }

    #[must_use]
    pub fn failed(correlation_id: impl Into<String>, failure_info: FailureInfo) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: Status::Failed,
            failure_info: Some(failure_info),
            outcomes: Vec::new(),
            partial_progress: None,
        }
    }

    /// Fold the remote outcome into a node conclusion.
    #[must_use]
    pub fn to_step_response(&self) -> StepResponse {
        StepResponse {
            status: self.status,
            failure_info: self.failure_info.clone(),
            outcomes: self.outcomes.clone(),
        }
    }
}

/// Cooperative-cancel notification for work already running remotely. The
/// engine finalizes the execution locally without waiting for an ack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterruptEvent {
    pub interrupt_id: String,
    pub interrupt_type: InterruptType,
    pub node_execution_id: String,
    pub ambiance: Ambiance,
    /// The suspension being interrupted, so the worker can locate in-flight
    /// work by correlation id.
    #[serde(default)]
    pub last_executable_response: Option<ExecutableResponse>,
}

/// A serialized message on a topic. Messages sharing a key are delivered in
/// publish order.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub key: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum RemoteDispatchError {
    #[error("failed to serialize envelope for topic {topic}")]
    #[diagnostic(code(planwright::transport::serialize))]
    Serialize {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("topic {topic} rejected publish: {detail}")]
    #[diagnostic(
        code(planwright::transport::publish),
        help("The messaging backend is unreachable or the topic is closed.")
    )]
    Publish { topic: String, detail: String },
}

/// Synchronous publish seam. Implementations must preserve per-key order.
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), RemoteDispatchError>;
}

/// Serialize `message` and publish it under `key` on `topic`.
pub fn publish_json<T: Serialize>(
    transport: &dyn Transport,
    topic: &str,
    key: &str,
    message: &T,
) -> Result<(), RemoteDispatchError> {
    let payload = serde_json::to_vec(message).map_err(|source| RemoteDispatchError::Serialize {
        topic: topic.to_string(),
        source,
    })?;
    transport.publish(
        topic,
        Envelope {
            key: key.to_string(),
            payload,
        },
    )
}

/// Channel-backed transport. Each topic is one unbounded flume channel;
/// receivers obtained via [`InMemoryTransport::subscribe`] see envelopes in
/// publish order.
#[derive(Default)]
pub struct InMemoryTransport {
    topics: Mutex<FxHashMap<String, (flume::Sender<Envelope>, flume::Receiver<Envelope>)>>,
}

impl InMemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver for a topic's envelopes. All subscribers share one queue.
    #[must_use]
    pub fn subscribe(&self, topic: &str) -> flume::Receiver<Envelope> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_string())
            .or_insert_with(flume::unbounded)
            .1
            .clone()
    }

    /// Drain and deserialize everything currently queued on a topic.
    pub fn drain<T: for<'de> Deserialize<'de>>(&self, topic: &str) -> Vec<T> {
        let rx = self.subscribe(topic);
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if let Ok(message) = serde_json::from_slice(&envelope.payload) {
                out.push(message);
            }
        }
        out
    }
}

impl Transport for InMemoryTransport {
    fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), RemoteDispatchError> {
        let sender = {
            let mut topics = self.topics.lock();
            topics
                .entry(topic.to_string())
                .or_insert_with(flume::unbounded)
                .0
                .clone()
        };
        sender
            .send(envelope)
            .map_err(|_| RemoteDispatchError::Publish {
                topic: topic.to_string(),
                detail: "all receivers dropped".to_string(),
            })
    }
}
