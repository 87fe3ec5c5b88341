//! Publishes a fix plan as a branch and retriggers CI on it.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::plan::{ChangeKind, FileChange, FixPlan};
use crate::error::{HealingError, HealingResult, ScmError};
use crate::scm::ScmClient;
use crate::storage::{HealingSession, PipelineEvent};

/// Workflow retried when the event does not name one.
pub const DEFAULT_WORKFLOW: &str = "ci";

/// Result of applying a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedFix {
    pub branch: String,
    /// Commit of the last file write, `None` when the plan touched no files.
    pub head_commit: Option<String>,
    pub files_changed: usize,
}

/// Applies plans through an [`ScmClient`].
#[derive(Clone)]
pub struct FixExecutor {
    scm: Arc<dyn ScmClient>,
    default_base_branch: String,
}

impl FixExecutor {
    pub fn new(scm: Arc<dyn ScmClient>, default_base_branch: impl Into<String>) -> Self {
        Self {
            scm,
            default_base_branch: default_base_branch.into(),
        }
    }

    /// Fix branch name for a session.
    pub fn branch_name(session: &HealingSession) -> String {
        format!(
            "autofix/healing-{}-{}",
            session.id,
            Utc::now().timestamp()
        )
    }

    /// Branch off the failed run's branch and commit every file change.
    ///
    /// Each change is its own commit. A failure part way through leaves the
    /// branch with the changes applied so far and is reported as an error.
    pub async fn create_branch_and_apply_fix(
        &self,
        session: &HealingSession,
        event: &PipelineEvent,
        plan: &FixPlan,
    ) -> HealingResult<AppliedFix> {
        let repo = event.repo_name.as_str();
        let base = if event.branch.trim().is_empty() {
            self.default_base_branch.as_str()
        } else {
            event.branch.as_str()
        };
        let branch = Self::branch_name(session);

        info!(session_id = %session.id, repo = %repo, base = %base, branch = %branch, "Creating fix branch");

        let base_sha = self
            .scm
            .get_ref_sha(repo, base)
            .await
            .map_err(|e| execution("resolve base branch", e))?;
        self.scm
            .create_ref(repo, &branch, &base_sha)
            .await
            .map_err(|e| execution("create fix branch", e))?;

        let mut head_commit = None;
        for (index, change) in plan.files_to_modify.iter().enumerate() {
            let commit = self
                .apply_change(repo, &branch, change, &session.id)
                .await
                .map_err(|e| HealingError::Execution {
                    message: format!(
                        "change {}/{} ({}) failed on branch {}: {}",
                        index + 1,
                        plan.files_to_modify.len(),
                        change.file_path,
                        branch,
                        e
                    ),
                })?;
            head_commit = Some(commit);
        }

        info!(
            session_id = %session.id,
            branch = %branch,
            files = plan.files_to_modify.len(),
            "Fix applied"
        );

        Ok(AppliedFix {
            branch,
            head_commit,
            files_changed: plan.files_to_modify.len(),
        })
    }

    async fn apply_change(
        &self,
        repo: &str,
        branch: &str,
        change: &FileChange,
        session_id: &str,
    ) -> Result<String, ScmError> {
        let path = change.file_path.as_str();
        let current_sha = self.scm.get_file_sha(repo, path, branch).await?;

        match change.change_type {
            ChangeKind::Delete => {
                let sha = current_sha.ok_or_else(|| ScmError::FileNotFound {
                    path: path.to_string(),
                })?;
                let message = format!("[healer] Delete {} (session {})", path, session_id);
                self.scm
                    .delete_file(repo, path, branch, &message, &sha)
                    .await
            }
            ChangeKind::Create | ChangeKind::Modify => {
                let message = format!("[healer] Auto-fix {} (session {})", path, session_id);
                let content = change.new_content.as_deref().unwrap_or_default();
                self.scm
                    .put_file(repo, path, branch, content, &message, current_sha)
                    .await
            }
        }
    }

    /// Dispatch the CI workflow on the fix branch. Never fails.
    pub async fn trigger_pipeline_retry(&self, event: &PipelineEvent, branch: &str) {
        let workflow = workflow_file(event.workflow_name.as_deref());
        match self
            .scm
            .dispatch_workflow(&event.repo_name, &workflow, branch)
            .await
        {
            Ok(()) => info!(repo = %event.repo_name, branch = %branch, "Pipeline retry dispatched"),
            Err(e) => warn!(
                repo = %event.repo_name,
                branch = %branch,
                error = %e,
                "Workflow dispatch failed, relying on push trigger"
            ),
        }
    }
}

/// Workflow file name for a workflow display name.
pub fn workflow_file(workflow_name: Option<&str>) -> String {
    let name = workflow_name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_WORKFLOW);
    if name.ends_with(".yml") || name.ends_with(".yaml") {
        name.to_string()
    } else {
        format!("{}.yml", name)
    }
}

fn execution(step: &str, error: ScmError) -> HealingError {
    HealingError::Execution {
        message: format!("failed to {}: {}", step, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scm::MockScmClient;
    use crate::storage::{FailureType, FixType, PipelineStatus};

    fn event() -> PipelineEvent {
        PipelineEvent::new("acme/api", "feature/login", "abc123", PipelineStatus::Failed)
            .with_workflow("build")
    }

    fn plan(changes: Vec<FileChange>) -> FixPlan {
        let mut plan = FixPlan::escalation("s", "r");
        plan.fix_type = FixType::ConfigChange;
        plan.confidence_score = 0.9;
        plan.files_to_modify = changes;
        plan
    }

    fn delete(path: &str) -> FileChange {
        FileChange {
            file_path: path.to_string(),
            change_type: ChangeKind::Delete,
            old_content: None,
            new_content: None,
            line_number: None,
            reason: None,
        }
    }

    #[test]
    fn test_workflow_file_names() {
        assert_eq!(workflow_file(Some("build")), "build.yml");
        assert_eq!(workflow_file(Some("deploy.yaml")), "deploy.yaml");
        assert_eq!(workflow_file(None), "ci.yml");
        assert_eq!(workflow_file(Some("  ")), "ci.yml");
    }

    #[test]
    fn test_branch_name_embeds_session() {
        let session = HealingSession::new("evt", FailureType::DockerFailure);
        let branch = FixExecutor::branch_name(&session);
        assert!(branch.starts_with(&format!("autofix/healing-{}-", session.id)));
    }

    #[tokio::test]
    async fn test_applies_changes_in_order() {
        let mut scm = MockScmClient::new();
        scm.expect_get_ref_sha()
            .withf(|repo, branch| repo == "acme/api" && branch == "feature/login")
            .times(1)
            .returning(|_, _| Ok("base-sha".to_string()));
        scm.expect_create_ref()
            .withf(|_, branch, sha| branch.starts_with("autofix/healing-") && sha == "base-sha")
            .times(1)
            .returning(|_, _, _| Ok(()));
        scm.expect_get_file_sha()
            .returning(|_, path, _| Ok((path == "Dockerfile").then(|| "blob-1".to_string())));
        scm.expect_put_file()
            .withf(|_, path, _, _, _, sha| path == "Dockerfile" && sha.as_deref() == Some("blob-1"))
            .times(1)
            .returning(|_, _, _, _, _, _| Ok("commit-1".to_string()));
        scm.expect_put_file()
            .withf(|_, path, _, _, _, sha| path == "docs/NEW.md" && sha.is_none())
            .times(1)
            .returning(|_, _, _, _, _, _| Ok("commit-2".to_string()));

        let executor = FixExecutor::new(Arc::new(scm), "main");
        let session = HealingSession::new("evt", FailureType::DockerFailure);
        let mut created = FileChange::modify("docs/NEW.md", "", "notes", "doc");
        created.change_type = ChangeKind::Create;

        let applied = executor
            .create_branch_and_apply_fix(
                &session,
                &event(),
                &plan(vec![
                    FileChange::modify("Dockerfile", "a", "b", "fix"),
                    created,
                ]),
            )
            .await
            .unwrap();

        assert_eq!(applied.files_changed, 2);
        assert_eq!(applied.head_commit.as_deref(), Some("commit-2"));
    }

    #[tokio::test]
    async fn test_delete_of_missing_file_fails() {
        let mut scm = MockScmClient::new();
        scm.expect_get_ref_sha().returning(|_, _| Ok("base".to_string()));
        scm.expect_create_ref().returning(|_, _, _| Ok(()));
        scm.expect_get_file_sha().returning(|_, _, _| Ok(None));
        scm.expect_delete_file().never();

        let executor = FixExecutor::new(Arc::new(scm), "main");
        let session = HealingSession::new("evt", FailureType::BuildCompile);
        let err = executor
            .create_branch_and_apply_fix(&session, &event(), &plan(vec![delete("old.txt")]))
            .await
            .unwrap_err();

        assert!(matches!(err, HealingError::Execution { .. }));
        assert!(err.to_string().contains("old.txt"));
    }

    #[tokio::test]
    async fn test_partial_application_is_an_error() {
        let mut scm = MockScmClient::new();
        scm.expect_get_ref_sha().returning(|_, _| Ok("base".to_string()));
        scm.expect_create_ref().returning(|_, _, _| Ok(()));
        scm.expect_get_file_sha().returning(|_, _, _| Ok(Some("blob".to_string())));
        scm.expect_put_file()
            .times(1)
            .returning(|_, _, _, _, _, _| Ok("commit-1".to_string()));
        scm.expect_delete_file()
            .times(1)
            .returning(|_, _, _, _, _| {
                Err(ScmError::Api {
                    status: 409,
                    message: "sha mismatch".to_string(),
                })
            });

        let executor = FixExecutor::new(Arc::new(scm), "main");
        let session = HealingSession::new("evt", FailureType::BuildCompile);
        let err = executor
            .create_branch_and_apply_fix(
                &session,
                &event(),
                &plan(vec![FileChange::modify("a.txt", "", "x", "r"), delete("b.txt")]),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("change 2/2"));
    }

    #[tokio::test]
    async fn test_retry_failure_is_swallowed() {
        let mut scm = MockScmClient::new();
        scm.expect_dispatch_workflow()
            .withf(|repo, workflow, git_ref| {
                repo == "acme/api" && workflow == "build.yml" && git_ref == "autofix/x"
            })
            .times(1)
            .returning(|_, _, _| {
                Err(ScmError::Api {
                    status: 404,
                    message: "no workflow_dispatch trigger".to_string(),
                })
            });

        let executor = FixExecutor::new(Arc::new(scm), "main");
        executor.trigger_pipeline_retry(&event(), "autofix/x").await;
    }
}
