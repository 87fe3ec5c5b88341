//! # Pipeline Healer
//!
//! A self-healing CI engine. Failed pipeline runs arrive as events; each
//! one is classified, scanned for leaked secrets, matched against a
//! knowledge base of proven fixes or handed to a fix generator, and then
//! either escalated, queued for approval or applied to the repository on a
//! fresh branch. The CI result on that branch feeds back into the
//! knowledge base.
//!
//! ## Architecture
//!
//! ```text
//! pipeline events (NDJSON) → PipelineEventConsumer → HealingOrchestrator
//!                                                      ├─ FailureClassifier / SecurityScanner
//!                                                      ├─ KnowledgeBase ─┐
//!                                                      ├─ FixGenerator   ├─ SQLite
//!                                                      ├─ Storage ───────┘
//!                                                      └─ FixExecutor → GitHub REST API
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pipeline_healer::{Config, HealingOrchestrator, KnowledgeBase};
//! use pipeline_healer::events::ChannelPublisher;
//! use pipeline_healer::healing::generator;
//! use pipeline_healer::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let knowledge = KnowledgeBase::new(storage.pool().clone(), config.knowledge.clone());
//!     let orchestrator = HealingOrchestrator::new(
//!         Arc::new(storage),
//!         knowledge,
//!         generator::from_config(&config),
//!         Arc::new(ChannelPublisher::default()),
//!         config.healing.clone(),
//!     );
//!     let session = orchestrator.recent_sessions(1).await?;
//!     println!("{:?}", session);
//!     Ok(())
//! }
//! ```

/// Command-line control surface.
pub mod cli;
/// Configuration loaded from the environment.
pub mod config;
/// Error types and result aliases.
pub mod error;
/// Inbound pipeline events and outbound healing/security streams.
pub mod events;
/// Classification, knowledge base, generation, execution and orchestration.
pub mod healing;
/// Anthropic Messages API client.
pub mod llm;
/// Prompt templates for fix generation.
pub mod prompts;
/// Source-hosting API port and GitHub adapter.
pub mod scm;
/// SQLite storage layer.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use healing::{HealingOrchestrator, KnowledgeBase};
