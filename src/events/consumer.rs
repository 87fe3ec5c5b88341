//! Partition-ordered consumer for newline-delimited pipeline events.
//!
//! Each message is routed to one of `concurrency` lanes by hashing its
//! partition key (`repoName:commitSha`). A lane handles its messages one at a
//! time, so events for the same commit are processed in arrival order while
//! different commits proceed in parallel. Lanes are bounded: reading stops
//! while the target lane is full.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::PipelineEventMessage;

/// Messages buffered per lane before the reader waits.
const LANE_CAPACITY: usize = 64;

/// Receives validated pipeline events.
#[async_trait]
pub trait PipelineEventHandler: Send + Sync + 'static {
    /// Handle one event. Must not panic; failures are handled internally.
    async fn handle(&self, message: PipelineEventMessage);
}

/// Counters reported when the input is exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Non-empty lines read.
    pub received: u64,
    /// Lines that parsed and were handed to a lane.
    pub dispatched: u64,
    /// Lines rejected as malformed.
    pub rejected: u64,
    /// Dispatched messages whose handler panicked.
    pub failed: u64,
}

/// Line-oriented event consumer.
pub struct PipelineEventConsumer<H: PipelineEventHandler> {
    handler: Arc<H>,
    concurrency: usize,
}

impl<H: PipelineEventHandler> PipelineEventConsumer<H> {
    pub fn new(handler: Arc<H>, concurrency: usize) -> Self {
        Self {
            handler,
            concurrency: concurrency.max(1),
        }
    }

    /// Consume until EOF, then wait for in-flight work to finish.
    pub async fn run<R>(&self, reader: R) -> std::io::Result<ConsumerStats>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lanes = Vec::with_capacity(self.concurrency);
        let mut workers = JoinSet::new();

        for lane in 0..self.concurrency {
            let (tx, mut rx) = mpsc::channel::<PipelineEventMessage>(LANE_CAPACITY);
            let handler = Arc::clone(&self.handler);
            workers.spawn(async move {
                let mut failed = 0u64;
                while let Some(message) = rx.recv().await {
                    let key = message.partition_key();
                    debug!(lane, key = %key, "Handling pipeline event");

                    // A panicking handler costs one message, not the lane
                    let handler = Arc::clone(&handler);
                    let task = tokio::spawn(async move { handler.handle(message).await });
                    if let Err(e) = task.await {
                        error!(lane, key = %key, error = %e, "Pipeline event handler panicked");
                        failed += 1;
                    }
                }
                failed
            });
            lanes.push(tx);
        }

        let mut stats = ConsumerStats::default();
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            stats.received += 1;

            let message = match PipelineEventMessage::parse(trimmed) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "Rejected malformed pipeline event");
                    stats.rejected += 1;
                    continue;
                }
            };

            let lane = lane_for(&message.partition_key(), self.concurrency);
            if lanes[lane].send(message).await.is_err() {
                error!(lane, "Consumer lane closed unexpectedly");
                stats.rejected += 1;
                continue;
            }
            stats.dispatched += 1;
        }

        info!(
            received = stats.received,
            dispatched = stats.dispatched,
            rejected = stats.rejected,
            "Input exhausted, draining lanes"
        );

        drop(lanes);
        while let Some(result) = workers.join_next().await {
            match result {
                Ok(failed) => stats.failed += failed,
                Err(e) => error!(error = %e, "Consumer lane terminated abnormally"),
            }
        }

        Ok(stats)
    }
}

fn lane_for(key: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}
