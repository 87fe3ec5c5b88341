//! Event records crossing the process boundary.
//!
//! Inbound: one [`PipelineEventMessage`] per pipeline state change, as
//! newline-delimited JSON. Outbound: [`HealingEvent`] per session save and
//! [`SecurityEvent`] per scan with findings, fanned out through an
//! [`EventPublisher`].

mod consumer;

pub use consumer::{ConsumerStats, PipelineEventConsumer, PipelineEventHandler};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, warn};

use crate::error::EventError;
use crate::storage::{FailureType, HealingSession, HealingStatus, PipelineEvent, PipelineStatus};

// ============================================================================
// Inbound
// ============================================================================

/// Canonical pipeline event produced by the webhook normalizer.
///
/// Unknown fields are ignored; a missing required field is a parse error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEventMessage {
    #[serde(default)]
    pub repo_url: Option<String>,
    pub repo_name: String,
    pub branch: String,
    pub commit_sha: String,
    pub provider: String,
    pub status: PipelineStatus,
    #[serde(default, deserialize_with = "string_or_number")]
    pub workflow_run_id: Option<String>,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub triggered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub raw_logs: Option<String>,
}

impl PipelineEventMessage {
    /// Parse and validate one JSON line.
    pub fn parse(line: &str) -> Result<Self, EventError> {
        let message: Self = serde_json::from_str(line)?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), EventError> {
        for (field, value) in [
            ("repoName", &self.repo_name),
            ("branch", &self.branch),
            ("commitSha", &self.commit_sha),
        ] {
            if value.trim().is_empty() {
                return Err(EventError::Invalid {
                    message: format!("{} must not be empty", field),
                });
            }
        }

        if !matches!(
            self.status,
            PipelineStatus::Queued
                | PipelineStatus::Running
                | PipelineStatus::Success
                | PipelineStatus::Failed
        ) {
            return Err(EventError::Invalid {
                message: format!("status {} is not a CI run state", self.status),
            });
        }

        Ok(())
    }

    /// Ordering key: events for the same commit are handled in order.
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.repo_name, self.commit_sha)
    }

    /// Only failed runs start a healing session.
    pub fn triggers_healing(&self) -> bool {
        self.status == PipelineStatus::Failed
    }

    /// Build the persisted pipeline event.
    pub fn to_pipeline_event(&self) -> PipelineEvent {
        let mut event = PipelineEvent::new(
            self.repo_name.clone(),
            self.branch.clone(),
            self.commit_sha.clone(),
            self.status,
        );
        event.repo_url = self.repo_url.clone();
        event.provider = self.provider.clone();
        event.workflow_run_id = self.workflow_run_id.clone();
        event.workflow_name = self.workflow_name.clone();
        event.raw_logs = self.raw_logs.clone();
        event.triggered_at = self.triggered_at;
        event.completed_at = self.completed_at;
        event
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RunId {
        Text(String),
        Number(i64),
    }

    Ok(Option::<RunId>::deserialize(deserializer)?.map(|id| match id {
        RunId::Text(s) => s,
        RunId::Number(n) => n.to_string(),
    }))
}

// ============================================================================
// Outbound
// ============================================================================

/// Session summary published on every session save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingEvent {
    pub session_id: String,
    pub pipeline_event_id: String,
    pub repo_name: String,
    pub failure_type: FailureType,
    pub healing_status: HealingStatus,
    pub confidence: f64,
    pub fix_branch: Option<String>,
    pub summary: Option<String>,
}

impl HealingEvent {
    pub fn from_session(session: &HealingSession, repo_name: &str) -> Self {
        Self {
            session_id: session.id.clone(),
            pipeline_event_id: session.pipeline_event_id.clone(),
            repo_name: repo_name.to_string(),
            failure_type: session.failure_type,
            healing_status: session.status,
            confidence: session.confidence,
            fix_branch: session.fix_branch.clone(),
            summary: session.failure_summary.clone(),
        }
    }
}

/// Per-scan severity counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub repo_name: String,
    pub branch: String,
    pub commit_sha: String,
    pub total_findings: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub pipeline_event_id: String,
}

/// Anything the engine emits, tagged with its stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stream", content = "payload", rename_all = "snake_case")]
pub enum OutboundEvent {
    Healing(HealingEvent),
    Security(SecurityEvent),
}

impl OutboundEvent {
    /// Partition key for downstream consumers.
    pub fn key(&self) -> &str {
        match self {
            OutboundEvent::Healing(e) => &e.repo_name,
            OutboundEvent::Security(e) => &e.repo_name,
        }
    }
}

/// Outbound event stream.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event. Callers treat failures as non-fatal.
    async fn publish(&self, event: OutboundEvent) -> Result<(), EventError>;
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Clone)]
pub struct ChannelPublisher {
    sender: broadcast::Sender<OutboundEvent>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Attach a new observer.
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.sender.subscribe()
    }
}

impl Default for ChannelPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(&self, event: OutboundEvent) -> Result<(), EventError> {
        let key = event.key().to_string();
        match self.sender.send(event) {
            Ok(receivers) => debug!(key = %key, receivers, "Published event"),
            // No observers attached is not an error for a fan-out stream
            Err(_) => debug!(key = %key, "Published event with no subscribers"),
        }
        Ok(())
    }
}

/// Drain an outbound subscription into `out` as JSON lines.
///
/// Stops when every publisher is dropped or the sink fails. Returns the
/// number of events written.
pub async fn write_ndjson<W>(mut events: broadcast::Receiver<OutboundEvent>, mut out: W) -> u64
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                let line = match serde_json::to_string(&event) {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize outbound event");
                        continue;
                    }
                };
                if let Err(e) = out.write_all(format!("{}\n", line).as_bytes()).await {
                    error!(error = %e, "Failed to write outbound event");
                    break;
                }
                if let Err(e) = out.flush().await {
                    error!(error = %e, "Failed to flush outbound event stream");
                    break;
                }
                written += 1;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Outbound event writer fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
    written
}
