//! Healing pipeline.
//!
//! - [`normalizer`]: volatile-token stripping and error signatures
//! - [`FailureClassifier`]: regex vote classifier
//! - [`SecurityScanner`]: log scan for leaked secrets and vulnerable dependencies
//! - [`KnowledgeBase`]: cache of proven fixes with Laplace-smoothed confidence
//! - [`FixGenerator`]: LLM-backed or deterministic plan generation
//! - [`FixExecutor`]: branch, commit and retrigger through an [`crate::scm::ScmClient`]
//! - [`HealingOrchestrator`]: the session state machine tying them together

mod classifier;
mod executor;
pub mod generator;
pub mod knowledge;
pub mod normalizer;
mod orchestrator;
mod plan;
pub mod security;

pub use classifier::{Classification, FailureClassifier};
pub use executor::{workflow_file, AppliedFix, FixExecutor, DEFAULT_WORKFLOW};
pub use generator::{FallbackFixGenerator, FixGenerator, LlmFixGenerator};
pub use knowledge::{
    laplace_confidence, CacheSource, CachedFix, KnowledgeBase, KnowledgeStats, OutcomeStats,
};
pub use orchestrator::{decide, Decision, HealingOrchestrator, FIX_BRANCH_PREFIX};
pub use plan::{ChangeKind, FileChange, FixPlan, HealingRequest};
pub use security::{scan_text, ScanOutcome, SecurityScanner};
