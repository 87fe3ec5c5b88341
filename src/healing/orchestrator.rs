//! Healing session state machine.
//!
//! ```text
//! ANALYZING -> FIX_GENERATED -> { PENDING_APPROVAL, APPLYING, ESCALATED }
//! PENDING_APPROVAL -> APPROVED -> APPLYING
//! APPLYING -> APPLIED -> PIPELINE_RETRIED -> { PIPELINE_PASSED, PIPELINE_FAILED_AGAIN -> ESCALATED }
//! any live state -> REJECTED -> ESCALATED
//! ```
//!
//! Every transition is saved, audited and published. Side channels (security
//! scan, knowledge base, event publishing, workflow retrigger) never abort
//! the primary flow; storage failures do.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::classifier::FailureClassifier;
use super::executor::FixExecutor;
use super::generator::FixGenerator;
use super::knowledge::{KnowledgeBase, KNOWLEDGE_BASE_REASON};
use super::plan::{FixPlan, HealingRequest};
use super::security::SecurityScanner;
use crate::config::HealingConfig;
use crate::error::{HealingError, HealingResult};
use crate::events::{
    EventPublisher, HealingEvent, OutboundEvent, PipelineEventHandler, PipelineEventMessage,
};
use crate::storage::{
    actor, AuditAction, AuditEntry, FindingStatus, FixType, HealingSession, HealingStats, HealingStatus,
    PipelineEvent, PipelineStatus, SecurityFinding, Storage,
};

/// Branch prefix of every fix branch pushed by the executor.
pub const FIX_BRANCH_PREFIX: &str = "autofix/healing-";

/// What to do with a freshly obtained plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Escalate { reason: String },
    AutoApply,
    AwaitApproval,
}

/// Decision policy shared by first attempts and regenerations.
pub fn decide(plan: &FixPlan, config: &HealingConfig) -> Decision {
    if plan.fix_type == FixType::Escalate {
        return Decision::Escalate {
            reason: "Generator requested escalation".to_string(),
        };
    }
    if plan.confidence_score < config.confidence_threshold {
        return Decision::Escalate {
            reason: format!(
                "Confidence {:.2} below threshold {:.2}",
                plan.confidence_score, config.confidence_threshold
            ),
        };
    }
    if config.auto_apply {
        Decision::AutoApply
    } else {
        Decision::AwaitApproval
    }
}

/// Where a plan came from.
enum PlanSource {
    Cache { fix_id: String },
    Generated { generator: &'static str },
}

/// Drives healing sessions end to end.
pub struct HealingOrchestrator {
    storage: Arc<dyn Storage>,
    knowledge: KnowledgeBase,
    classifier: FailureClassifier,
    scanner: SecurityScanner,
    generator: Arc<dyn FixGenerator>,
    executor: Option<FixExecutor>,
    publisher: Arc<dyn EventPublisher>,
    config: HealingConfig,
}

impl HealingOrchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        knowledge: KnowledgeBase,
        generator: Arc<dyn FixGenerator>,
        publisher: Arc<dyn EventPublisher>,
        config: HealingConfig,
    ) -> Self {
        let scanner = SecurityScanner::new(Arc::clone(&storage), Arc::clone(&publisher));
        Self {
            storage,
            knowledge,
            classifier: FailureClassifier::new(),
            scanner,
            generator,
            executor: None,
            publisher,
            config,
        }
    }

    /// Enable fix application. Without an executor, applying escalates.
    pub fn with_executor(mut self, executor: FixExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    // ========================================================================
    // Control surface
    // ========================================================================

    /// Start healing a failed pipeline run.
    ///
    /// Returns the session in whatever state the decision policy left it.
    pub async fn handle_failure(&self, event: PipelineEvent) -> HealingResult<HealingSession> {
        self.storage.create_pipeline_event(&event).await?;

        let outcome = self.scanner.scan_pipeline_event(&event).await;
        debug!(event_id = %event.id, outcome = ?outcome, "Security scan finished");

        let classification = self.classifier.classify_detailed(event.logs());
        let failure_type = classification.failure_type;

        let mut session = HealingSession::new(event.id.clone(), failure_type);
        self.storage.create_healing_session(&session).await?;
        self.storage
            .append_audit(
                &session.id,
                AuditAction::FailureDetected,
                actor::AI,
                Some(&format!("{} failed on {}@{}", event.repo_name, event.branch, event.commit_sha)),
            )
            .await?;
        self.storage
            .append_audit(
                &session.id,
                AuditAction::Classified,
                actor::AI,
                Some(&format!("{} (score {})", failure_type, classification.score)),
            )
            .await?;
        self.storage
            .update_pipeline_status(&event.id, PipelineStatus::Healing)
            .await?;
        self.publish(&session, &event).await;

        info!(
            session_id = %session.id,
            repo = %event.repo_name,
            failure_type = %failure_type,
            "Healing session started"
        );

        let cached = self.lookup_cache(&session, &event).await;
        let (plan, source) = match cached {
            Some((plan, fix_id)) => (plan, PlanSource::Cache { fix_id }),
            None => {
                let request = build_request(&event, &session);
                match self.generator.generate_fix(&request).await {
                    Ok(plan) => (
                        plan,
                        PlanSource::Generated {
                            generator: self.generator.name(),
                        },
                    ),
                    Err(e) => {
                        error!(session_id = %session.id, error = %e, "Fix generation failed");
                        let reason = format!("AI analysis failed: {}", e);
                        session.failure_summary = Some(reason.clone());
                        self.escalate(&mut session, &event, &reason).await?;
                        return Ok(session);
                    }
                }
            }
        };

        self.adopt_plan(&mut session, &event, &plan, source).await?;
        self.apply_decision(&mut session, &event, &plan).await?;
        Ok(session)
    }

    /// Approve a pending fix and apply it.
    pub async fn approve(&self, session_id: &str) -> HealingResult<HealingSession> {
        let (mut session, event) = self.load(session_id).await?;
        if session.status != HealingStatus::PendingApproval {
            return Err(invalid_state(&session, "approve"));
        }
        let plan = stored_plan(&session)?;

        self.transition(
            &mut session,
            &event,
            HealingStatus::Approved,
            AuditAction::FixApproved,
            actor::HUMAN,
            None,
        )
        .await?;
        self.transition(
            &mut session,
            &event,
            HealingStatus::Applying,
            AuditAction::FixApplying,
            actor::SYSTEM,
            None,
        )
        .await?;

        self.execute(&mut session, &event, &plan).await?;
        Ok(session)
    }

    /// Reject a fix. The session ends ESCALATED and the fix is penalized.
    pub async fn reject(&self, session_id: &str) -> HealingResult<HealingSession> {
        let (mut session, event) = self.load(session_id).await?;
        if session.status.is_terminal() {
            return Err(invalid_state(&session, "reject"));
        }

        self.transition(
            &mut session,
            &event,
            HealingStatus::Rejected,
            AuditAction::FixRejected,
            actor::HUMAN,
            Some("Rejected by developer"),
        )
        .await?;
        self.record_outcome(&session.id, false).await;

        if session.failure_summary.as_deref().unwrap_or("").is_empty() {
            session.failure_summary = Some("Fix rejected by developer".to_string());
        }
        self.set_status(
            &mut session,
            &event,
            HealingStatus::Escalated,
            AuditAction::Escalated,
            actor::SYSTEM,
            Some("Fix rejected, manual remediation required"),
        )
        .await?;
        self.storage
            .update_pipeline_status(&event.id, PipelineStatus::Escalated)
            .await?;

        info!(session_id = %session.id, "Fix rejected");
        Ok(session)
    }

    /// Retire a session and start a new attempt guided by developer feedback.
    ///
    /// Returns the child session.
    pub async fn regenerate(
        &self,
        session_id: &str,
        feedback: &str,
    ) -> HealingResult<HealingSession> {
        let (mut original, event) = self.load(session_id).await?;
        if !original.status.allows_regenerate() {
            return Err(invalid_state(&original, "regenerate"));
        }

        original.user_feedback = Some(feedback.to_string());
        self.set_status(
            &mut original,
            &event,
            HealingStatus::Rejected,
            AuditAction::FixRejected,
            actor::HUMAN,
            Some(&format!("Re-code requested: {}", feedback)),
        )
        .await?;

        let mut child = HealingSession::child_of(&original);
        child.user_feedback = Some(feedback.to_string());
        self.storage.create_healing_session(&child).await?;
        self.storage
            .append_audit(
                &child.id,
                AuditAction::FixRegenerated,
                actor::HUMAN,
                Some(&format!("Attempt #{}", child.attempt_number)),
            )
            .await?;
        self.storage
            .update_pipeline_status(&event.id, PipelineStatus::Healing)
            .await?;
        self.publish(&child, &event).await;

        info!(
            parent_id = %original.id,
            session_id = %child.id,
            attempt = child.attempt_number,
            "Regenerating fix"
        );

        let request = build_request(&event, &child);
        let previous = original.fix_plan_json.as_deref().unwrap_or("{}");
        let plan = match self
            .generator
            .regenerate_fix(&request, previous, feedback)
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                error!(session_id = %child.id, error = %e, "Fix regeneration failed");
                let reason = format!("Re-code failed: {}", e);
                child.failure_summary = Some(reason.clone());
                self.escalate(&mut child, &event, &reason).await?;
                return Ok(child);
            }
        };

        let source = PlanSource::Generated {
            generator: self.generator.name(),
        };
        self.adopt_plan(&mut child, &event, &plan, source).await?;
        self.apply_decision(&mut child, &event, &plan).await?;
        Ok(child)
    }

    /// Close the loop once CI has run on the fix branch.
    pub async fn record_pipeline_result(
        &self,
        session_id: &str,
        passed: bool,
    ) -> HealingResult<HealingSession> {
        let (mut session, event) = self.load(session_id).await?;
        if session.status != HealingStatus::PipelineRetried {
            return Err(invalid_state(&session, "record a pipeline result for"));
        }

        self.record_outcome(&session.id, passed).await;

        if passed {
            self.transition(
                &mut session,
                &event,
                HealingStatus::PipelinePassed,
                AuditAction::PipelinePassed,
                actor::SYSTEM,
                None,
            )
            .await?;
            self.storage
                .update_pipeline_status(&event.id, PipelineStatus::Healed)
                .await?;
            info!(session_id = %session.id, "Pipeline healed");
        } else {
            self.transition(
                &mut session,
                &event,
                HealingStatus::PipelineFailedAgain,
                AuditAction::PipelineFailedAgain,
                actor::SYSTEM,
                None,
            )
            .await?;
            self.escalate(&mut session, &event, "Pipeline still failing after the fix")
                .await?;
        }

        Ok(session)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_session(&self, session_id: &str) -> HealingResult<HealingSession> {
        self.storage
            .get_healing_session(session_id)
            .await?
            .ok_or_else(|| HealingError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub async fn recent_sessions(&self, limit: i64) -> HealingResult<Vec<HealingSession>> {
        Ok(self.storage.list_recent_sessions(limit).await?)
    }

    /// Stored plan of a session, `None` before generation.
    pub async fn fix_plan(&self, session_id: &str) -> HealingResult<Option<FixPlan>> {
        let session = self.get_session(session_id).await?;
        match session.fix_plan_json {
            Some(_) => stored_plan(&session).map(Some),
            None => Ok(None),
        }
    }

    pub async fn audit_log(&self, session_id: &str) -> HealingResult<Vec<AuditEntry>> {
        self.get_session(session_id).await?;
        Ok(self.storage.get_audit_log(session_id).await?)
    }

    pub async fn healing_stats(&self) -> HealingResult<HealingStats> {
        Ok(self.storage.healing_stats().await?)
    }

    pub async fn findings_for_commit(
        &self,
        repo_name: &str,
        commit_sha: &str,
    ) -> HealingResult<Vec<SecurityFinding>> {
        Ok(self
            .storage
            .get_findings_for_commit(repo_name, commit_sha)
            .await?)
    }

    pub async fn update_finding_status(
        &self,
        finding_id: &str,
        status: FindingStatus,
    ) -> HealingResult<()> {
        self.storage.update_finding_status(finding_id, status).await?;
        info!(finding_id = %finding_id, status = %status, "Finding triaged");
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn load(&self, session_id: &str) -> HealingResult<(HealingSession, PipelineEvent)> {
        let session = self.get_session(session_id).await?;
        let event = self
            .storage
            .get_pipeline_event(&session.pipeline_event_id)
            .await?
            .ok_or_else(|| HealingError::Execution {
                message: format!(
                    "pipeline event {} of session {} is missing",
                    session.pipeline_event_id, session.id
                ),
            })?;
        Ok((session, event))
    }

    async fn lookup_cache(
        &self,
        session: &HealingSession,
        event: &PipelineEvent,
    ) -> Option<(FixPlan, String)> {
        let hit = match self
            .knowledge
            .find_cached_fix(session.failure_type, &event.repo_name, event.logs())
            .await
        {
            Ok(hit) => hit?,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Knowledge base lookup failed");
                return None;
            }
        };

        if let Err(e) = self.knowledge.link_session(&session.id, &hit.fix_id).await {
            warn!(session_id = %session.id, error = %e, "Failed to link cached fix");
        }
        Some((hit.plan, hit.fix_id))
    }

    /// Copy the plan onto the session and move to FIX_GENERATED.
    async fn adopt_plan(
        &self,
        session: &mut HealingSession,
        event: &PipelineEvent,
        plan: &FixPlan,
        source: PlanSource,
    ) -> HealingResult<()> {
        if !plan.failure_summary.is_empty() {
            session.failure_summary = Some(plan.failure_summary.clone());
        }
        session.root_cause = Some(plan.root_cause.clone()).filter(|s| !s.is_empty());
        session.fix_explanation = Some(plan.fix_explanation.clone()).filter(|s| !s.is_empty());
        session.fix_type = Some(plan.fix_type);
        session.fix_plan_json = Some(plan.to_json()?);
        session.confidence = plan.confidence_score;

        let (who, note) = match source {
            PlanSource::Cache { fix_id } => {
                debug!(session_id = %session.id, fix_id = %fix_id, "Using cached fix");
                (actor::KNOWLEDGE_BASE, KNOWLEDGE_BASE_REASON.to_string())
            }
            PlanSource::Generated { generator } => {
                if let Err(e) = self
                    .knowledge
                    .store_fix(session, &event.repo_name, plan, event.logs())
                    .await
                {
                    warn!(session_id = %session.id, error = %e, "Failed to store fix in knowledge base");
                }
                (
                    actor::AI,
                    format!(
                        "{} plan, {} at confidence {:.2}",
                        generator, plan.fix_type, plan.confidence_score
                    ),
                )
            }
        };

        self.transition(
            session,
            event,
            HealingStatus::FixGenerated,
            AuditAction::FixGenerated,
            who,
            Some(&note),
        )
        .await
    }

    async fn apply_decision(
        &self,
        session: &mut HealingSession,
        event: &PipelineEvent,
        plan: &FixPlan,
    ) -> HealingResult<()> {
        match decide(plan, &self.config) {
            Decision::Escalate { reason } => self.escalate(session, event, &reason).await,
            Decision::AwaitApproval => {
                self.transition(
                    session,
                    event,
                    HealingStatus::PendingApproval,
                    AuditAction::ApprovalRequested,
                    actor::SYSTEM,
                    None,
                )
                .await
            }
            Decision::AutoApply => {
                self.transition(
                    session,
                    event,
                    HealingStatus::Applying,
                    AuditAction::FixApplying,
                    actor::SYSTEM,
                    Some("Auto-apply enabled"),
                )
                .await?;
                self.execute(session, event, plan).await
            }
        }
    }

    /// Push the fix and retrigger CI. Execution failures escalate.
    async fn execute(
        &self,
        session: &mut HealingSession,
        event: &PipelineEvent,
        plan: &FixPlan,
    ) -> HealingResult<()> {
        let Some(executor) = &self.executor else {
            return self
                .escalate(session, event, "No source hosting client configured")
                .await;
        };

        let applied = match executor
            .create_branch_and_apply_fix(session, event, plan)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Fix application failed");
                return self
                    .escalate(session, event, &format!("Fix application failed: {}", e))
                    .await;
            }
        };

        session.fix_branch = Some(applied.branch.clone());
        session.fix_commit_sha = applied.head_commit.clone();
        self.transition(
            session,
            event,
            HealingStatus::Applied,
            AuditAction::FixCommitted,
            actor::SYSTEM,
            Some(&format!(
                "{} file(s) committed to {}",
                applied.files_changed, applied.branch
            )),
        )
        .await?;

        executor.trigger_pipeline_retry(event, &applied.branch).await;
        self.transition(
            session,
            event,
            HealingStatus::PipelineRetried,
            AuditAction::PipelineRetried,
            actor::SYSTEM,
            None,
        )
        .await
    }

    async fn escalate(
        &self,
        session: &mut HealingSession,
        event: &PipelineEvent,
        reason: &str,
    ) -> HealingResult<()> {
        if session.failure_summary.as_deref().unwrap_or("").is_empty() {
            session.failure_summary = Some(reason.to_string());
        }
        self.transition(
            session,
            event,
            HealingStatus::Escalated,
            AuditAction::Escalated,
            actor::SYSTEM,
            Some(reason),
        )
        .await?;
        self.storage
            .update_pipeline_status(&event.id, PipelineStatus::Escalated)
            .await?;

        warn!(session_id = %session.id, reason = %reason, "Session escalated");
        Ok(())
    }

    /// Checked transition.
    async fn transition(
        &self,
        session: &mut HealingSession,
        event: &PipelineEvent,
        next: HealingStatus,
        action: AuditAction,
        who: &str,
        note: Option<&str>,
    ) -> HealingResult<()> {
        if !session.status.can_transition_to(next) {
            return Err(HealingError::InvalidState {
                session_id: session.id.clone(),
                status: session.status.to_string(),
                operation: "transition",
            });
        }
        self.set_status(session, event, next, action, who, note).await
    }

    /// Save, audit and publish a status change.
    async fn set_status(
        &self,
        session: &mut HealingSession,
        event: &PipelineEvent,
        next: HealingStatus,
        action: AuditAction,
        who: &str,
        note: Option<&str>,
    ) -> HealingResult<()> {
        debug!(session_id = %session.id, from = %session.status, to = %next, "Session transition");

        let now = Utc::now();
        session.status = next;
        session.updated_at = now;
        if next.is_terminal() {
            session.resolved_at = Some(now);
        }

        self.storage.update_healing_session(session).await?;
        self.storage
            .append_audit(&session.id, action, who, note)
            .await?;
        self.publish(session, event).await;
        Ok(())
    }

    async fn publish(&self, session: &HealingSession, event: &PipelineEvent) {
        let healing = HealingEvent::from_session(session, &event.repo_name);
        if let Err(e) = self.publisher.publish(OutboundEvent::Healing(healing)).await {
            warn!(session_id = %session.id, error = %e, "Failed to publish healing event");
        }
    }

    async fn record_outcome(&self, session_id: &str, success: bool) {
        if let Err(e) = self.knowledge.record_outcome(session_id, success).await {
            warn!(session_id = %session_id, error = %e, "Failed to record fix outcome");
        }
    }

    async fn route_fix_branch_result(&self, message: &PipelineEventMessage) {
        let session = match self
            .storage
            .find_session_by_fix_branch(&message.repo_name, &message.branch)
            .await
        {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!(branch = %message.branch, "No session owns fix branch");
                return;
            }
            Err(e) => {
                error!(branch = %message.branch, error = %e, "Fix branch lookup failed");
                return;
            }
        };

        if session.status != HealingStatus::PipelineRetried {
            debug!(
                session_id = %session.id,
                status = %session.status,
                "Ignoring fix branch result for settled session"
            );
            return;
        }

        let passed = message.status == PipelineStatus::Success;
        if let Err(e) = self.record_pipeline_result(&session.id, passed).await {
            error!(session_id = %session.id, error = %e, "Failed to record pipeline result");
        }
    }
}

#[async_trait]
impl PipelineEventHandler for HealingOrchestrator {
    async fn handle(&self, message: PipelineEventMessage) {
        let settled = matches!(
            message.status,
            PipelineStatus::Success | PipelineStatus::Failed
        );

        if message.branch.starts_with(FIX_BRANCH_PREFIX) {
            if settled {
                self.route_fix_branch_result(&message).await;
            }
            return;
        }

        if !message.triggers_healing() {
            debug!(key = %message.partition_key(), status = %message.status, "Ignoring pipeline event");
            return;
        }

        match self.handle_failure(message.to_pipeline_event()).await {
            Ok(session) => info!(
                session_id = %session.id,
                status = %session.status,
                "Pipeline failure handled"
            ),
            Err(e) => error!(
                key = %message.partition_key(),
                error = %e,
                "Failed to handle pipeline failure"
            ),
        }
    }
}

fn build_request(event: &PipelineEvent, session: &HealingSession) -> HealingRequest {
    HealingRequest::new(event.raw_logs.clone(), session.failure_type)
}

fn stored_plan(session: &HealingSession) -> HealingResult<FixPlan> {
    let json = session
        .fix_plan_json
        .as_deref()
        .ok_or_else(|| HealingError::InvalidPlan {
            message: format!("session {} has no fix plan", session.id),
        })?;
    FixPlan::from_json(json)
}

fn invalid_state(session: &HealingSession, operation: &'static str) -> HealingError {
    HealingError::InvalidState {
        session_id: session.id.clone(),
        status: session.status.to_string(),
        operation,
    }
}
