//! Storage layer for pipeline runs and healing state.
//!
//! This module provides SQLite-based storage for pipeline events, healing
//! sessions, their audit trail, and security findings. Knowledge base
//! tables live in the same database but are owned by
//! [`crate::healing::knowledge`].

mod sqlite;

pub use sqlite::SqliteStorage;
pub(crate) use sqlite::{parse_enum, parse_optional_timestamp, parse_timestamp};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;

// ============================================================================
// Enums
// ============================================================================

/// Lifecycle of a single CI run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Queued,
    Running,
    Success,
    Failed,
    Healing,
    Healed,
    Escalated,
}

impl PipelineStatus {
    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Queued => "QUEUED",
            PipelineStatus::Running => "RUNNING",
            PipelineStatus::Success => "SUCCESS",
            PipelineStatus::Failed => "FAILED",
            PipelineStatus::Healing => "HEALING",
            PipelineStatus::Healed => "HEALED",
            PipelineStatus::Escalated => "ESCALATED",
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Ok(PipelineStatus::Queued),
            "RUNNING" => Ok(PipelineStatus::Running),
            "SUCCESS" => Ok(PipelineStatus::Success),
            "FAILED" => Ok(PipelineStatus::Failed),
            "HEALING" => Ok(PipelineStatus::Healing),
            "HEALED" => Ok(PipelineStatus::Healed),
            "ESCALATED" => Ok(PipelineStatus::Escalated),
            _ => Err(format!("Unknown pipeline status: {}", s)),
        }
    }
}

/// Coarse reason a pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    BuildCompile,
    TestFailure,
    DependencyConflict,
    Infrastructure,
    DockerFailure,
    Unknown,
}

impl FailureType {
    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::BuildCompile => "BUILD_COMPILE",
            FailureType::TestFailure => "TEST_FAILURE",
            FailureType::DependencyConflict => "DEPENDENCY_CONFLICT",
            FailureType::Infrastructure => "INFRASTRUCTURE",
            FailureType::DockerFailure => "DOCKER_FAILURE",
            FailureType::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUILD_COMPILE" => Ok(FailureType::BuildCompile),
            "TEST_FAILURE" => Ok(FailureType::TestFailure),
            "DEPENDENCY_CONFLICT" => Ok(FailureType::DependencyConflict),
            "INFRASTRUCTURE" => Ok(FailureType::Infrastructure),
            "DOCKER_FAILURE" => Ok(FailureType::DockerFailure),
            "UNKNOWN" => Ok(FailureType::Unknown),
            _ => Err(format!("Unknown failure type: {}", s)),
        }
    }
}

/// Healing session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealingStatus {
    Analyzing,
    FixGenerated,
    PendingApproval,
    Approved,
    Rejected,
    Applying,
    Applied,
    PipelineRetried,
    PipelinePassed,
    PipelineFailedAgain,
    Escalated,
}

impl HealingStatus {
    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealingStatus::Analyzing => "ANALYZING",
            HealingStatus::FixGenerated => "FIX_GENERATED",
            HealingStatus::PendingApproval => "PENDING_APPROVAL",
            HealingStatus::Approved => "APPROVED",
            HealingStatus::Rejected => "REJECTED",
            HealingStatus::Applying => "APPLYING",
            HealingStatus::Applied => "APPLIED",
            HealingStatus::PipelineRetried => "PIPELINE_RETRIED",
            HealingStatus::PipelinePassed => "PIPELINE_PASSED",
            HealingStatus::PipelineFailedAgain => "PIPELINE_FAILED_AGAIN",
            HealingStatus::Escalated => "ESCALATED",
        }
    }

    /// No further transitions apart from spawning a child session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HealingStatus::Escalated | HealingStatus::PipelinePassed | HealingStatus::Rejected
        )
    }

    /// Whether `regenerate` may start a new attempt from this state.
    pub fn allows_regenerate(&self) -> bool {
        matches!(
            self,
            HealingStatus::PendingApproval | HealingStatus::FixGenerated | HealingStatus::Escalated
        )
    }

    /// Legal edges of the session state machine.
    pub fn can_transition_to(&self, next: HealingStatus) -> bool {
        use HealingStatus::*;

        if self.is_terminal() {
            return false;
        }
        // Any live session may be escalated or rejected
        if matches!(next, Escalated | Rejected) {
            return true;
        }
        matches!(
            (self, next),
            (Analyzing, FixGenerated)
                | (FixGenerated, PendingApproval)
                | (FixGenerated, Applying)
                | (PendingApproval, Approved)
                | (Approved, Applying)
                | (Applying, Applied)
                | (Applied, PipelineRetried)
                | (PipelineRetried, PipelinePassed)
                | (PipelineRetried, PipelineFailedAgain)
        )
    }
}

impl std::fmt::Display for HealingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HealingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ANALYZING" => Ok(HealingStatus::Analyzing),
            "FIX_GENERATED" => Ok(HealingStatus::FixGenerated),
            "PENDING_APPROVAL" => Ok(HealingStatus::PendingApproval),
            "APPROVED" => Ok(HealingStatus::Approved),
            "REJECTED" => Ok(HealingStatus::Rejected),
            "APPLYING" => Ok(HealingStatus::Applying),
            "APPLIED" => Ok(HealingStatus::Applied),
            "PIPELINE_RETRIED" => Ok(HealingStatus::PipelineRetried),
            "PIPELINE_PASSED" => Ok(HealingStatus::PipelinePassed),
            "PIPELINE_FAILED_AGAIN" => Ok(HealingStatus::PipelineFailedAgain),
            "ESCALATED" => Ok(HealingStatus::Escalated),
            _ => Err(format!("Unknown healing status: {}", s)),
        }
    }
}

/// Kind of remediation a plan proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixType {
    CodeChange,
    ConfigChange,
    Escalate,
}

impl FixType {
    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FixType::CodeChange => "CODE_CHANGE",
            FixType::ConfigChange => "CONFIG_CHANGE",
            FixType::Escalate => "ESCALATE",
        }
    }
}

impl std::fmt::Display for FixType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FixType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CODE_CHANGE" => Ok(FixType::CodeChange),
            "CONFIG_CHANGE" => Ok(FixType::ConfigChange),
            "ESCALATE" => Ok(FixType::Escalate),
            _ => Err(format!("Unknown fix type: {}", s)),
        }
    }
}

/// Audit trail actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    FailureDetected,
    Classified,
    FixGenerated,
    ApprovalRequested,
    FixApproved,
    FixRejected,
    FixApplying,
    FixCommitted,
    PipelineRetried,
    PipelinePassed,
    PipelineFailedAgain,
    Escalated,
    FixRegenerated,
}

impl AuditAction {
    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::FailureDetected => "FAILURE_DETECTED",
            AuditAction::Classified => "CLASSIFIED",
            AuditAction::FixGenerated => "FIX_GENERATED",
            AuditAction::ApprovalRequested => "APPROVAL_REQUESTED",
            AuditAction::FixApproved => "FIX_APPROVED",
            AuditAction::FixRejected => "FIX_REJECTED",
            AuditAction::FixApplying => "FIX_APPLYING",
            AuditAction::FixCommitted => "FIX_COMMITTED",
            AuditAction::PipelineRetried => "PIPELINE_RETRIED",
            AuditAction::PipelinePassed => "PIPELINE_PASSED",
            AuditAction::PipelineFailedAgain => "PIPELINE_FAILED_AGAIN",
            AuditAction::Escalated => "ESCALATED",
            AuditAction::FixRegenerated => "FIX_REGENERATED",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "FAILURE_DETECTED" => Ok(AuditAction::FailureDetected),
            "CLASSIFIED" => Ok(AuditAction::Classified),
            "FIX_GENERATED" => Ok(AuditAction::FixGenerated),
            "APPROVAL_REQUESTED" => Ok(AuditAction::ApprovalRequested),
            "FIX_APPROVED" => Ok(AuditAction::FixApproved),
            "FIX_REJECTED" => Ok(AuditAction::FixRejected),
            "FIX_APPLYING" => Ok(AuditAction::FixApplying),
            "FIX_COMMITTED" => Ok(AuditAction::FixCommitted),
            "PIPELINE_RETRIED" => Ok(AuditAction::PipelineRetried),
            "PIPELINE_PASSED" => Ok(AuditAction::PipelinePassed),
            "PIPELINE_FAILED_AGAIN" => Ok(AuditAction::PipelineFailedAgain),
            "ESCALATED" => Ok(AuditAction::Escalated),
            "FIX_REGENERATED" => Ok(AuditAction::FixRegenerated),
            _ => Err(format!("Unknown audit action: {}", s)),
        }
    }
}

/// Who performed an audited action.
pub mod actor {
    pub const AI: &str = "AI";
    pub const KNOWLEDGE_BASE: &str = "KNOWLEDGE_BASE";
    pub const HUMAN: &str = "HUMAN";
    pub const SYSTEM: &str = "SYSTEM";
}

/// Security finding severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
            Severity::Info => "INFO",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CRITICAL" => Ok(Severity::Critical),
            "HIGH" => Ok(Severity::High),
            "MEDIUM" => Ok(Severity::Medium),
            "LOW" => Ok(Severity::Low),
            "INFO" => Ok(Severity::Info),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

/// Triage status of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingStatus {
    Open,
    Suppressed,
    Fixed,
    FalsePositive,
}

impl FindingStatus {
    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingStatus::Open => "OPEN",
            FindingStatus::Suppressed => "SUPPRESSED",
            FindingStatus::Fixed => "FIXED",
            FindingStatus::FalsePositive => "FALSE_POSITIVE",
        }
    }
}

impl std::fmt::Display for FindingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FindingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OPEN" => Ok(FindingStatus::Open),
            "SUPPRESSED" => Ok(FindingStatus::Suppressed),
            "FIXED" => Ok(FindingStatus::Fixed),
            "FALSE_POSITIVE" => Ok(FindingStatus::FalsePositive),
            _ => Err(format!("Unknown finding status: {}", s)),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// One CI run as received from the webhook normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Unique event identifier.
    pub id: String,
    pub repo_url: Option<String>,
    /// `owner/name` slug.
    pub repo_name: String,
    pub branch: String,
    pub commit_sha: String,
    /// CI provider, e.g. `GITHUB_ACTIONS`.
    pub provider: String,
    pub status: PipelineStatus,
    pub workflow_run_id: Option<String>,
    pub workflow_name: Option<String>,
    pub raw_logs: Option<String>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineEvent {
    /// Create a new event for a run on `repo_name@branch`.
    pub fn new(
        repo_name: impl Into<String>,
        branch: impl Into<String>,
        commit_sha: impl Into<String>,
        status: PipelineStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            repo_url: None,
            repo_name: repo_name.into(),
            branch: branch.into(),
            commit_sha: commit_sha.into(),
            provider: "GITHUB_ACTIONS".to_string(),
            status,
            workflow_run_id: None,
            workflow_name: None,
            raw_logs: None,
            triggered_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set raw logs.
    pub fn with_logs(mut self, logs: impl Into<String>) -> Self {
        self.raw_logs = Some(logs.into());
        self
    }

    /// Set workflow name.
    pub fn with_workflow(mut self, workflow_name: impl Into<String>) -> Self {
        self.workflow_name = Some(workflow_name.into());
        self
    }

    /// Raw logs or the empty string.
    pub fn logs(&self) -> &str {
        self.raw_logs.as_deref().unwrap_or("")
    }
}

/// One remediation attempt for a failed pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingSession {
    /// Unique session identifier.
    pub id: String,
    /// Pipeline run being healed.
    pub pipeline_event_id: String,
    pub failure_type: FailureType,
    pub failure_summary: Option<String>,
    pub root_cause: Option<String>,
    pub fix_explanation: Option<String>,
    pub fix_type: Option<FixType>,
    /// Serialized [`crate::healing::FixPlan`], owned by this session.
    pub fix_plan_json: Option<String>,
    /// Confidence score (0.0-1.0).
    pub confidence: f64,
    pub status: HealingStatus,
    pub fix_branch: Option<String>,
    pub fix_commit_sha: Option<String>,
    /// 1 for the first attempt, incremented by regeneration.
    pub attempt_number: i64,
    /// Lineage only; the parent is not owned.
    pub parent_session_id: Option<String>,
    pub user_feedback: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl HealingSession {
    /// Create a new session in ANALYZING.
    pub fn new(pipeline_event_id: impl Into<String>, failure_type: FailureType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            pipeline_event_id: pipeline_event_id.into(),
            failure_type,
            failure_summary: None,
            root_cause: None,
            fix_explanation: None,
            fix_type: None,
            fix_plan_json: None,
            confidence: 0.0,
            status: HealingStatus::Analyzing,
            fix_branch: None,
            fix_commit_sha: None,
            attempt_number: 1,
            parent_session_id: None,
            user_feedback: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }

    /// Start a follow-up attempt linked to `parent`.
    pub fn child_of(parent: &HealingSession) -> Self {
        let mut child = Self::new(parent.pipeline_event_id.clone(), parent.failure_type);
        child.attempt_number = parent.attempt_number + 1;
        child.parent_session_id = Some(parent.id.clone());
        child
    }
}

/// One append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic creation-order key.
    pub seq: i64,
    pub session_id: String,
    pub action: AuditAction,
    pub actor: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One vulnerability signal found in pipeline logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityFinding {
    pub id: String,
    pub pipeline_event_id: Option<String>,
    pub repo_name: String,
    pub branch: String,
    pub commit_sha: String,
    pub scan_provider: String,
    pub severity: Severity,
    /// Category, e.g. `HARDCODED_CREDENTIAL`.
    pub vulnerability_type: String,
    /// CVE id for dependency findings.
    pub vulnerability_id: Option<String>,
    pub title: String,
    pub description: String,
    pub remediation: String,
    pub file_path: Option<String>,
    pub line_number: Option<i64>,
    pub status: FindingStatus,
    /// Matched snippet.
    pub raw_finding: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregates over healing sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealingStats {
    pub total_sessions: i64,
    pub by_status: Vec<(String, i64)>,
    pub by_failure_type: Vec<(String, i64)>,
    /// Mean seconds from session creation to resolution.
    pub mean_time_to_resolution_secs: Option<f64>,
}

// ============================================================================
// Storage trait
// ============================================================================

/// Storage trait for healing persistence.
#[async_trait]
pub trait Storage: Send + Sync {
    // Pipeline events

    /// Persist a new pipeline event.
    async fn create_pipeline_event(&self, event: &PipelineEvent) -> StorageResult<()>;
    /// Get a pipeline event by ID.
    async fn get_pipeline_event(&self, id: &str) -> StorageResult<Option<PipelineEvent>>;
    /// Update only the lifecycle status of a pipeline event.
    async fn update_pipeline_status(&self, id: &str, status: PipelineStatus) -> StorageResult<()>;

    // Healing sessions

    /// Persist a new healing session.
    async fn create_healing_session(&self, session: &HealingSession) -> StorageResult<()>;
    /// Get a healing session by ID.
    async fn get_healing_session(&self, id: &str) -> StorageResult<Option<HealingSession>>;
    /// Save all mutable session fields.
    async fn update_healing_session(&self, session: &HealingSession) -> StorageResult<()>;
    /// Most recent sessions first.
    async fn list_recent_sessions(&self, limit: i64) -> StorageResult<Vec<HealingSession>>;
    /// Latest session that pushed `branch` to `repo_name`.
    async fn find_session_by_fix_branch(
        &self,
        repo_name: &str,
        branch: &str,
    ) -> StorageResult<Option<HealingSession>>;
    /// Session counts and time to resolution.
    async fn healing_stats(&self) -> StorageResult<HealingStats>;

    // Audit log

    /// Append one audit entry.
    async fn append_audit(
        &self,
        session_id: &str,
        action: AuditAction,
        actor: &str,
        note: Option<&str>,
    ) -> StorageResult<()>;
    /// Audit trail in creation order.
    async fn get_audit_log(&self, session_id: &str) -> StorageResult<Vec<AuditEntry>>;

    // Security findings

    /// Number of findings stored for a commit.
    async fn count_findings_for_commit(&self, repo_name: &str, commit_sha: &str)
        -> StorageResult<i64>;
    /// Persist a batch of findings atomically.
    async fn create_security_findings(&self, findings: &[SecurityFinding]) -> StorageResult<()>;
    /// Findings for a commit, most severe first.
    async fn get_findings_for_commit(
        &self,
        repo_name: &str,
        commit_sha: &str,
    ) -> StorageResult<Vec<SecurityFinding>>;
    /// Change the triage status of a finding.
    async fn update_finding_status(&self, id: &str, status: FindingStatus) -> StorageResult<()>;
}
