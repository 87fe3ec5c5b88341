//! End-to-end tests for the healing state machine
//!
//! Runs the orchestrator against an in-memory database, a scripted fix
//! generator and a recording source-hosting fake.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use pipeline_healer::config::{HealingConfig, KnowledgeConfig};
use pipeline_healer::error::{HealingError, HealingResult, ScmError, ScmResult};
use pipeline_healer::events::{
    ChannelPublisher, OutboundEvent, PipelineEventHandler, PipelineEventMessage,
};
use pipeline_healer::healing::knowledge::KNOWLEDGE_BASE_REASON;
use pipeline_healer::healing::{
    FallbackFixGenerator, FileChange, FixExecutor, FixGenerator, FixPlan, HealingOrchestrator,
    HealingRequest, KnowledgeBase,
};
use pipeline_healer::scm::ScmClient;
use pipeline_healer::storage::{
    AuditAction, FailureType, FixType, HealingSession, HealingStatus, PipelineEvent,
    PipelineStatus, SqliteStorage, Storage,
};

const COMPILE_LOGS: &str = "[INFO] Compiling 42 source files\n[ERROR] COMPILATION ERROR\n\
[ERROR] /app/src/main/java/com/acme/Svc.java:[17,9] cannot find symbol";

// ============================================================================
// Fakes
// ============================================================================

/// Returns a fixed plan, or fails when none is scripted.
struct ScriptedGenerator {
    plan: Option<FixPlan>,
    calls: AtomicUsize,
    regenerations: Mutex<Vec<(String, String)>>,
}

impl ScriptedGenerator {
    fn new(plan: Option<FixPlan>) -> Self {
        Self {
            plan,
            calls: AtomicUsize::new(0),
            regenerations: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn respond(&self) -> HealingResult<FixPlan> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.plan.clone().ok_or_else(|| HealingError::Generation {
            message: "model unavailable".to_string(),
        })
    }
}

#[async_trait]
impl FixGenerator for ScriptedGenerator {
    async fn generate_fix(&self, _request: &HealingRequest) -> HealingResult<FixPlan> {
        self.respond()
    }

    async fn regenerate_fix(
        &self,
        _request: &HealingRequest,
        previous_plan_json: &str,
        feedback: &str,
    ) -> HealingResult<FixPlan> {
        self.regenerations
            .lock()
            .unwrap()
            .push((previous_plan_json.to_string(), feedback.to_string()));
        self.respond()
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Records every call; optionally rejects file writes.
#[derive(Default)]
struct FakeScm {
    calls: Mutex<Vec<String>>,
    fail_writes: bool,
}

impl FakeScm {
    fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScmClient for FakeScm {
    async fn get_ref_sha(&self, _repo: &str, branch: &str) -> ScmResult<String> {
        self.record(format!("get_ref {}", branch));
        Ok("base-sha".to_string())
    }

    async fn create_ref(&self, _repo: &str, branch: &str, _sha: &str) -> ScmResult<()> {
        self.record(format!("create_ref {}", branch));
        Ok(())
    }

    async fn get_file_sha(
        &self,
        _repo: &str,
        _path: &str,
        _branch: &str,
    ) -> ScmResult<Option<String>> {
        Ok(Some("blob-1".to_string()))
    }

    async fn put_file(
        &self,
        _repo: &str,
        path: &str,
        _branch: &str,
        _content: &str,
        _message: &str,
        _sha: Option<String>,
    ) -> ScmResult<String> {
        if self.fail_writes {
            return Err(ScmError::Api {
                status: 403,
                message: "Resource not accessible by integration".to_string(),
            });
        }
        self.record(format!("put {}", path));
        Ok("commit-1".to_string())
    }

    async fn delete_file(
        &self,
        _repo: &str,
        path: &str,
        _branch: &str,
        _message: &str,
        _sha: &str,
    ) -> ScmResult<String> {
        self.record(format!("delete {}", path));
        Ok("commit-d".to_string())
    }

    async fn dispatch_workflow(
        &self,
        _repo: &str,
        workflow_file: &str,
        git_ref: &str,
    ) -> ScmResult<()> {
        self.record(format!("dispatch {} {}", workflow_file, git_ref));
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    storage: Arc<SqliteStorage>,
    orchestrator: HealingOrchestrator,
    generator: Arc<ScriptedGenerator>,
    scm: Arc<FakeScm>,
    events: broadcast::Receiver<OutboundEvent>,
}

async fn harness_with(plan: Option<FixPlan>, healing: HealingConfig, scm: Option<FakeScm>) -> Harness {
    let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
    let knowledge = KnowledgeBase::new(storage.pool().clone(), KnowledgeConfig::default());
    let generator = Arc::new(ScriptedGenerator::new(plan));
    let publisher = Arc::new(ChannelPublisher::default());
    let events = publisher.subscribe();

    let mut orchestrator = HealingOrchestrator::new(
        storage.clone(),
        knowledge,
        generator.clone(),
        publisher,
        healing,
    );

    let with_scm = scm.is_some();
    let scm = Arc::new(scm.unwrap_or_default());
    if with_scm {
        orchestrator = orchestrator.with_executor(FixExecutor::new(scm.clone(), "main"));
    }

    Harness {
        storage,
        orchestrator,
        generator,
        scm,
        events,
    }
}

async fn harness(plan: Option<FixPlan>) -> Harness {
    harness_with(plan, HealingConfig::default(), None).await
}

async fn harness_with_scm(plan: Option<FixPlan>) -> Harness {
    harness_with(plan, HealingConfig::default(), Some(FakeScm::default())).await
}

fn code_plan(confidence: f64) -> FixPlan {
    FixPlan {
        failure_summary: "Svc calls a method that was removed".to_string(),
        root_cause: "Refactoring dropped Repository.findActive".to_string(),
        fix_explanation: "Restore the method".to_string(),
        fix_type: FixType::CodeChange,
        files_to_modify: vec![FileChange::modify(
            "src/main/java/com/acme/Repository.java",
            "",
            "List<Item> findActive() { return List.of(); }",
            "restore method",
        )],
        commands: vec!["mvn clean compile -q".to_string()],
        confidence_score: confidence,
        human_readable_reason: "A method referenced by Svc no longer exists.".to_string(),
        prevention_tips: Vec::new(),
    }
}

fn failed_event(commit: &str) -> PipelineEvent {
    PipelineEvent::new("acme/api", "feature/login", commit, PipelineStatus::Failed)
        .with_logs(COMPILE_LOGS)
        .with_workflow("build")
}

async fn audit_actions(h: &Harness, session: &HealingSession) -> Vec<AuditAction> {
    h.orchestrator
        .audit_log(&session.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect()
}

async fn event_status(h: &Harness, session: &HealingSession) -> PipelineStatus {
    h.storage
        .get_pipeline_event(&session.pipeline_event_id)
        .await
        .unwrap()
        .unwrap()
        .status
}

fn healing_statuses(events: &mut broadcast::Receiver<OutboundEvent>) -> Vec<HealingStatus> {
    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let OutboundEvent::Healing(e) = event {
            statuses.push(e.healing_status);
        }
    }
    statuses
}

/// Drive a fresh failure to PIPELINE_RETRIED through approval.
async fn retried_session(h: &Harness) -> HealingSession {
    let pending = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();
    assert_eq!(pending.status, HealingStatus::PendingApproval);
    h.orchestrator.approve(&pending.id).await.unwrap()
}

// ============================================================================
// Failure intake
// ============================================================================

#[cfg(test)]
mod intake_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_confident_plan_awaits_approval() {
        let mut h = harness(Some(code_plan(0.9))).await;

        let session = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();

        assert_eq!(session.status, HealingStatus::PendingApproval);
        assert_eq!(session.failure_type, FailureType::BuildCompile);
        assert_eq!(session.fix_type, Some(FixType::CodeChange));
        assert_eq!(session.confidence, 0.9);
        assert_eq!(h.generator.calls(), 1);

        assert_eq!(
            audit_actions(&h, &session).await,
            vec![
                AuditAction::FailureDetected,
                AuditAction::Classified,
                AuditAction::FixGenerated,
                AuditAction::ApprovalRequested,
            ]
        );
        assert_eq!(event_status(&h, &session).await, PipelineStatus::Healing);
        assert_eq!(
            healing_statuses(&mut h.events),
            vec![
                HealingStatus::Analyzing,
                HealingStatus::FixGenerated,
                HealingStatus::PendingApproval,
            ]
        );

        let stored = h.orchestrator.fix_plan(&session.id).await.unwrap().unwrap();
        assert_eq!(stored, code_plan(0.9));
        assert_eq!(h.orchestrator.knowledge().get_stats().await.unwrap().total_fixes, 1);
    }

    #[tokio::test]
    async fn test_fallback_generator_compile_failure_awaits_approval() {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let knowledge = KnowledgeBase::new(storage.pool().clone(), KnowledgeConfig::default());
        let orchestrator = HealingOrchestrator::new(
            storage.clone(),
            knowledge,
            Arc::new(FallbackFixGenerator::new()),
            Arc::new(ChannelPublisher::default()),
            HealingConfig::default(),
        );
        let logs = "[ERROR] COMPILATION ERROR :\n\
[ERROR] /ci/src/main/java/com/acme/UserService.java:[42,20] error: cannot find symbol\n  \
symbol:   method findByEmail(String)\n  location: class com.acme.UserRepository\n";
        let event = PipelineEvent::new("acme/api", "main", "abc123", PipelineStatus::Failed)
            .with_logs(logs);

        let session = orchestrator.handle_failure(event).await.unwrap();

        assert_eq!(session.failure_type, FailureType::BuildCompile);
        assert_eq!(session.fix_type, Some(FixType::CodeChange));
        assert!(session.confidence >= HealingConfig::default().confidence_threshold);
        assert_eq!(session.status, HealingStatus::PendingApproval);

        let plan = orchestrator.fix_plan(&session.id).await.unwrap().unwrap();
        assert_eq!(
            plan.files_to_modify[0].file_path,
            "src/main/java/com/acme/UserRepository.java"
        );
    }

    #[tokio::test]
    async fn test_cached_fix_skips_generator() {
        let h = harness(Some(code_plan(0.9))).await;
        h.orchestrator.handle_failure(failed_event("c1")).await.unwrap();
        assert_eq!(h.generator.calls(), 1);

        let cached = h.orchestrator.handle_failure(failed_event("c2")).await.unwrap();

        assert_eq!(h.generator.calls(), 1);
        let plan = h.orchestrator.fix_plan(&cached.id).await.unwrap().unwrap();
        assert_eq!(plan.human_readable_reason, KNOWLEDGE_BASE_REASON);

        // Unproven category match: capped at the knowledge threshold, below the healing one
        assert_eq!(plan.confidence_score, KnowledgeConfig::default().min_confidence);
        assert_eq!(cached.status, HealingStatus::Escalated);

        let log = h.orchestrator.audit_log(&cached.id).await.unwrap();
        let generated = log
            .iter()
            .find(|e| e.action == AuditAction::FixGenerated)
            .unwrap();
        assert_eq!(generated.actor, "KNOWLEDGE_BASE");
        assert_eq!(generated.note.as_deref(), Some(KNOWLEDGE_BASE_REASON));

        // Served, not stored again
        assert_eq!(h.orchestrator.knowledge().get_stats().await.unwrap().total_fixes, 1);
    }

    #[tokio::test]
    async fn test_unproven_cached_fix_is_never_auto_applied() {
        let config = HealingConfig {
            auto_apply: true,
            ..HealingConfig::default()
        };
        let h = harness_with(Some(code_plan(0.95)), config, Some(FakeScm::default())).await;
        let first = h.orchestrator.handle_failure(failed_event("c1")).await.unwrap();
        assert_eq!(first.status, HealingStatus::PipelineRetried);
        let calls_after_first = h.scm.calls().len();

        let other = PipelineEvent::new("acme/web", "main", "c2", PipelineStatus::Failed)
            .with_logs("[ERROR] COMPILATION ERROR\n[ERROR] cannot find symbol Bar totally different");
        let cached = h.orchestrator.handle_failure(other).await.unwrap();

        assert_eq!(h.generator.calls(), 1);
        assert_eq!(cached.status, HealingStatus::Escalated);
        assert!(cached.fix_branch.is_none());
        assert_eq!(h.scm.calls().len(), calls_after_first);
    }

    #[tokio::test]
    async fn test_generator_failure_escalates() {
        let mut h = harness(None).await;

        let session = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();

        assert_eq!(session.status, HealingStatus::Escalated);
        let summary = session.failure_summary.clone().unwrap();
        assert!(summary.contains("AI analysis failed"), "{}", summary);
        assert!(session.resolved_at.is_some());
        assert_eq!(event_status(&h, &session).await, PipelineStatus::Escalated);
        assert_eq!(
            audit_actions(&h, &session).await.last(),
            Some(&AuditAction::Escalated)
        );
        assert_eq!(
            healing_statuses(&mut h.events).last(),
            Some(&HealingStatus::Escalated)
        );

        let reloaded = h.orchestrator.get_session(&session.id).await.unwrap();
        assert_eq!(reloaded.status, HealingStatus::Escalated);
        assert!(!reloaded.failure_summary.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_low_confidence_escalates() {
        let h = harness(Some(code_plan(0.5))).await;

        let session = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();

        assert_eq!(session.status, HealingStatus::Escalated);
        let log = h.orchestrator.audit_log(&session.id).await.unwrap();
        let escalated = log.last().unwrap();
        assert_eq!(escalated.action, AuditAction::Escalated);
        assert!(escalated.note.as_deref().unwrap().contains("below threshold"));
    }

    #[tokio::test]
    async fn test_escalation_plan_escalates() {
        let plan = FixPlan::escalation("No idea", "Logs are empty");
        let h = harness(Some(plan)).await;

        let session = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();
        assert_eq!(session.status, HealingStatus::Escalated);
        assert_eq!(session.failure_summary.as_deref(), Some("No idea"));
    }

    #[tokio::test]
    async fn test_security_findings_recorded_once_per_commit() {
        let mut h = harness(Some(code_plan(0.9))).await;
        let logs = format!("{}\nconfig: password = \"hunter2hunter2\"", COMPILE_LOGS);
        let event = failed_event("deadbeef").with_logs(logs.clone());

        h.orchestrator.handle_failure(event).await.unwrap();

        let findings = h
            .orchestrator
            .findings_for_commit("acme/api", "deadbeef")
            .await
            .unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].vulnerability_type, "HARDCODED_CREDENTIAL");

        let mut security_events = 0;
        while let Ok(event) = h.events.try_recv() {
            if let OutboundEvent::Security(e) = event {
                assert_eq!(e.critical, 1);
                security_events += 1;
            }
        }
        assert_eq!(security_events, 1);

        // Same commit re-run: no duplicate findings
        let rerun = failed_event("deadbeef").with_logs(logs);
        h.orchestrator.handle_failure(rerun).await.unwrap();
        let findings = h
            .orchestrator
            .findings_for_commit("acme/api", "deadbeef")
            .await
            .unwrap();
        assert_eq!(findings.len(), 1);
    }
}

// ============================================================================
// Human decisions
// ============================================================================

#[cfg(test)]
mod decision_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_approve_applies_and_retries() {
        let h = harness_with_scm(Some(code_plan(0.9))).await;

        let session = retried_session(&h).await;

        assert_eq!(session.status, HealingStatus::PipelineRetried);
        let branch = session.fix_branch.clone().unwrap();
        assert!(branch.starts_with(&format!("autofix/healing-{}-", session.id)));
        assert_eq!(session.fix_commit_sha.as_deref(), Some("commit-1"));

        let calls = h.scm.calls();
        assert_eq!(calls[0], "get_ref feature/login");
        assert_eq!(calls[1], format!("create_ref {}", branch));
        assert_eq!(calls[2], "put src/main/java/com/acme/Repository.java");
        assert_eq!(calls[3], format!("dispatch build.yml {}", branch));

        let actions = audit_actions(&h, &session).await;
        assert_eq!(
            actions[actions.len() - 4..].to_vec(),
            vec![
                AuditAction::FixApproved,
                AuditAction::FixApplying,
                AuditAction::FixCommitted,
                AuditAction::PipelineRetried,
            ]
        );
        assert_eq!(event_status(&h, &session).await, PipelineStatus::Healing);
    }

    #[tokio::test]
    async fn test_approve_without_scm_escalates() {
        let h = harness(Some(code_plan(0.9))).await;
        let pending = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();

        let session = h.orchestrator.approve(&pending.id).await.unwrap();

        assert_eq!(session.status, HealingStatus::Escalated);
        let log = h.orchestrator.audit_log(&session.id).await.unwrap();
        assert!(log
            .last()
            .unwrap()
            .note
            .as_deref()
            .unwrap()
            .contains("No source hosting client"));
    }

    #[tokio::test]
    async fn test_apply_failure_escalates() {
        let h = harness_with(
            Some(code_plan(0.9)),
            HealingConfig::default(),
            Some(FakeScm::failing_writes()),
        )
        .await;
        let pending = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();

        let session = h.orchestrator.approve(&pending.id).await.unwrap();

        assert_eq!(session.status, HealingStatus::Escalated);
        assert!(session.fix_branch.is_none());
        let log = h.orchestrator.audit_log(&session.id).await.unwrap();
        let note = log.last().unwrap().note.clone().unwrap();
        assert!(note.contains("Fix application failed"), "{}", note);
        assert_eq!(event_status(&h, &session).await, PipelineStatus::Escalated);
    }

    #[tokio::test]
    async fn test_approve_requires_pending_approval() {
        let h = harness(None).await;
        let escalated = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();

        let err = h.orchestrator.approve(&escalated.id).await.unwrap_err();
        assert!(matches!(err, HealingError::InvalidState { .. }));

        let unchanged = h.orchestrator.get_session(&escalated.id).await.unwrap();
        assert_eq!(unchanged.status, HealingStatus::Escalated);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let h = harness(None).await;
        let err = h.orchestrator.approve("missing").await.unwrap_err();
        assert!(matches!(err, HealingError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_reject_escalates_and_penalizes_fix() {
        let h = harness(Some(code_plan(0.9))).await;
        let pending = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();

        let session = h.orchestrator.reject(&pending.id).await.unwrap();

        assert_eq!(session.status, HealingStatus::Escalated);
        let actions = audit_actions(&h, &session).await;
        assert_eq!(
            actions[actions.len() - 2..].to_vec(),
            vec![AuditAction::FixRejected, AuditAction::Escalated]
        );
        assert_eq!(event_status(&h, &session).await, PipelineStatus::Escalated);

        // One failed application: (0 + 1) / (1 + 2)
        let stats = h.orchestrator.knowledge().get_stats().await.unwrap();
        assert!((stats.average_confidence - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reject_terminal_session_fails() {
        let h = harness(None).await;
        let escalated = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();

        let err = h.orchestrator.reject(&escalated.id).await.unwrap_err();
        assert!(matches!(err, HealingError::InvalidState { .. }));
    }
}

// ============================================================================
// Regeneration
// ============================================================================

#[cfg(test)]
mod regenerate_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_regenerate_creates_child_attempt() {
        let h = harness(Some(code_plan(0.9))).await;
        let original = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();

        let child = h
            .orchestrator
            .regenerate(&original.id, "Use Optional instead of a stub")
            .await
            .unwrap();

        assert_eq!(child.attempt_number, 2);
        assert_eq!(child.parent_session_id.as_deref(), Some(original.id.as_str()));
        assert_eq!(child.pipeline_event_id, original.pipeline_event_id);
        assert_eq!(child.status, HealingStatus::PendingApproval);
        assert_eq!(
            child.user_feedback.as_deref(),
            Some("Use Optional instead of a stub")
        );
        assert_eq!(
            audit_actions(&h, &child).await.first(),
            Some(&AuditAction::FixRegenerated)
        );

        let retired = h.orchestrator.get_session(&original.id).await.unwrap();
        assert_eq!(retired.status, HealingStatus::Rejected);
        assert!(retired.resolved_at.is_some());
        assert_eq!(
            retired.user_feedback.as_deref(),
            Some("Use Optional instead of a stub")
        );

        let regenerations = h.generator.regenerations.lock().unwrap().clone();
        assert_eq!(regenerations.len(), 1);
        assert!(regenerations[0].0.contains("CODE_CHANGE"));
        assert_eq!(regenerations[0].1, "Use Optional instead of a stub");
    }

    #[tokio::test]
    async fn test_regenerate_after_escalation() {
        let h = harness(Some(code_plan(0.5))).await;
        let escalated = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();
        assert_eq!(escalated.status, HealingStatus::Escalated);

        let child = h.orchestrator.regenerate(&escalated.id, "try again").await.unwrap();

        assert_eq!(child.attempt_number, 2);
        assert_eq!(child.status, HealingStatus::Escalated);
        let retired = h.orchestrator.get_session(&escalated.id).await.unwrap();
        assert_eq!(retired.status, HealingStatus::Rejected);
    }

    #[tokio::test]
    async fn test_regenerate_rejected_once_applied() {
        let h = harness_with_scm(Some(code_plan(0.9))).await;
        let retried = retried_session(&h).await;

        let err = h
            .orchestrator
            .regenerate(&retried.id, "too late")
            .await
            .unwrap_err();
        assert!(matches!(err, HealingError::InvalidState { .. }));
    }
}

// ============================================================================
// Pipeline feedback
// ============================================================================

#[cfg(test)]
mod feedback_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn message(branch: &str, commit: &str, status: &str) -> PipelineEventMessage {
        PipelineEventMessage::parse(
            &serde_json::json!({
                "repoName": "acme/api",
                "branch": branch,
                "commitSha": commit,
                "provider": "GITHUB_ACTIONS",
                "status": status,
                "workflowName": "build",
                "rawLogs": COMPILE_LOGS
            })
            .to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_passing_pipeline_heals() {
        let h = harness_with_scm(Some(code_plan(0.9))).await;
        let retried = retried_session(&h).await;

        let session = h
            .orchestrator
            .record_pipeline_result(&retried.id, true)
            .await
            .unwrap();

        assert_eq!(session.status, HealingStatus::PipelinePassed);
        assert!(session.resolved_at.is_some());
        assert_eq!(event_status(&h, &session).await, PipelineStatus::Healed);

        // One successful application: (1 + 1) / (1 + 2)
        let stats = h.orchestrator.knowledge().get_stats().await.unwrap();
        assert!((stats.average_confidence - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failing_pipeline_escalates() {
        let h = harness_with_scm(Some(code_plan(0.9))).await;
        let retried = retried_session(&h).await;

        let session = h
            .orchestrator
            .record_pipeline_result(&retried.id, false)
            .await
            .unwrap();

        assert_eq!(session.status, HealingStatus::Escalated);
        let actions = audit_actions(&h, &session).await;
        assert_eq!(
            actions[actions.len() - 2..].to_vec(),
            vec![AuditAction::PipelineFailedAgain, AuditAction::Escalated]
        );
        assert_eq!(event_status(&h, &session).await, PipelineStatus::Escalated);
    }

    #[tokio::test]
    async fn test_result_requires_retried_session() {
        let h = harness(Some(code_plan(0.9))).await;
        let pending = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();

        let err = h
            .orchestrator
            .record_pipeline_result(&pending.id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, HealingError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_auto_apply_skips_approval() {
        let config = HealingConfig {
            auto_apply: true,
            ..HealingConfig::default()
        };
        let h = harness_with(Some(code_plan(0.9)), config, Some(FakeScm::default())).await;

        let session = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();

        assert_eq!(session.status, HealingStatus::PipelineRetried);
        let log = h.orchestrator.audit_log(&session.id).await.unwrap();
        assert!(!log.iter().any(|e| e.action == AuditAction::ApprovalRequested));
        let applying = log
            .iter()
            .find(|e| e.action == AuditAction::FixApplying)
            .unwrap();
        assert_eq!(applying.note.as_deref(), Some("Auto-apply enabled"));
    }

    #[tokio::test]
    async fn test_fix_branch_result_closes_session() {
        let config = HealingConfig {
            auto_apply: true,
            ..HealingConfig::default()
        };
        let h = harness_with(Some(code_plan(0.9)), config, Some(FakeScm::default())).await;
        let session = h.orchestrator.handle_failure(failed_event("abc123")).await.unwrap();
        let branch = session.fix_branch.clone().unwrap();

        h.orchestrator.handle(message(&branch, "fixsha", "SUCCESS")).await;

        let closed = h.orchestrator.get_session(&session.id).await.unwrap();
        assert_eq!(closed.status, HealingStatus::PipelinePassed);

        // A late duplicate is ignored
        h.orchestrator.handle(message(&branch, "fixsha", "FAILED")).await;
        let still = h.orchestrator.get_session(&session.id).await.unwrap();
        assert_eq!(still.status, HealingStatus::PipelinePassed);
    }

    #[tokio::test]
    async fn test_handler_heals_failures_only() {
        let h = harness(Some(code_plan(0.9))).await;

        h.orchestrator.handle(message("main", "s1", "SUCCESS")).await;
        h.orchestrator.handle(message("main", "s2", "RUNNING")).await;
        assert!(h.orchestrator.recent_sessions(10).await.unwrap().is_empty());

        h.orchestrator.handle(message("main", "f1", "FAILED")).await;
        let sessions = h.orchestrator.recent_sessions(10).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, HealingStatus::PendingApproval);

        let stats = h.orchestrator.healing_stats().await.unwrap();
        assert_eq!(stats.total_sessions, 1);
    }
}
