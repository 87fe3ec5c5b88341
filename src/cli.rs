//! Control-surface commands.
//!
//! Human decisions (approve, reject, regenerate) and read-only views over
//! sessions, the audit trail, the knowledge base and security findings.

use clap::Subcommand;

use crate::healing::HealingOrchestrator;
use crate::storage::{AuditEntry, FailureType, FindingStatus, HealingSession};

const RULE: &str =
    "═══════════════════════════════════════════════════════════════════════════════\n\n";

/// Control-surface subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum HealCommands {
    /// Approve a pending fix and apply it
    Approve {
        /// Healing session id
        session_id: String,
    },

    /// Reject a fix and escalate the session
    Reject {
        /// Healing session id
        session_id: String,
    },

    /// Discard a fix and generate a new one from developer feedback
    Regenerate {
        /// Healing session id
        session_id: String,

        /// What was wrong with the previous fix
        #[arg(long)]
        feedback: String,
    },

    /// Record the CI result of a retried fix branch
    Result {
        /// Healing session id
        session_id: String,

        /// The retried pipeline passed
        #[arg(long, conflicts_with = "failed")]
        passed: bool,

        /// The retried pipeline failed
        #[arg(long)]
        failed: bool,
    },

    /// List recent healing sessions
    Sessions {
        /// Maximum number of sessions to show
        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Show one session with its fix plan
    Session {
        /// Healing session id
        session_id: String,
    },

    /// Show the audit trail of a session
    Audit {
        /// Healing session id
        session_id: String,
    },

    /// Show healing statistics
    Stats,

    /// Inspect the knowledge base
    #[command(subcommand)]
    Kb(KbCommands),

    /// Show security findings for a commit
    Findings {
        /// Repository slug (owner/name)
        repo: String,

        /// Commit SHA
        commit: String,
    },

    /// Change the triage status of a security finding
    Triage {
        /// Finding id
        finding_id: String,

        /// open, suppressed, fixed, false_positive
        status: String,
    },
}

/// Knowledge base subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum KbCommands {
    /// Show pattern and fix counts
    Stats,

    /// List failure patterns by hit count
    Patterns {
        /// Filter by failure type, e.g. BUILD_COMPILE
        #[arg(long = "type")]
        failure_type: Option<String>,
    },

    /// List fixes stored for a pattern
    Fixes {
        /// Pattern id
        pattern_id: String,
    },
}

/// Result of CLI command execution.
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Execute a control-surface command.
pub async fn execute_command(command: HealCommands, orchestrator: &HealingOrchestrator) -> CliResult {
    match command {
        HealCommands::Approve { session_id } => {
            session_outcome("Approved", orchestrator.approve(&session_id).await)
        }
        HealCommands::Reject { session_id } => {
            session_outcome("Rejected", orchestrator.reject(&session_id).await)
        }
        HealCommands::Regenerate {
            session_id,
            feedback,
        } => session_outcome(
            "Regenerated",
            orchestrator.regenerate(&session_id, &feedback).await,
        ),
        HealCommands::Result {
            session_id,
            passed,
            failed,
        } => {
            if passed == failed {
                return CliResult::error("Pass exactly one of --passed or --failed");
            }
            session_outcome(
                "Recorded",
                orchestrator
                    .record_pipeline_result(&session_id, passed)
                    .await,
            )
        }
        HealCommands::Sessions { limit } => execute_sessions(orchestrator, limit).await,
        HealCommands::Session { session_id } => execute_session(orchestrator, &session_id).await,
        HealCommands::Audit { session_id } => execute_audit(orchestrator, &session_id).await,
        HealCommands::Stats => execute_stats(orchestrator).await,
        HealCommands::Kb(kb) => execute_kb(orchestrator, kb).await,
        HealCommands::Findings { repo, commit } => {
            execute_findings(orchestrator, &repo, &commit).await
        }
        HealCommands::Triage { finding_id, status } => {
            let status: FindingStatus = match status.parse() {
                Ok(s) => s,
                Err(e) => return CliResult::error(e),
            };
            match orchestrator.update_finding_status(&finding_id, status).await {
                Ok(()) => CliResult::success(format!("Finding {} marked {}\n", finding_id, status)),
                Err(e) => CliResult::error(format!("Error: {}\n", e)),
            }
        }
    }
}

fn session_outcome(
    verb: &str,
    result: Result<HealingSession, crate::error::HealingError>,
) -> CliResult {
    match result {
        Ok(session) => CliResult::success(format!(
            "{}: session {} is now {}\n",
            verb, session.id, session.status
        )),
        Err(e) => CliResult::error(format!("Error: {}\n", e)),
    }
}

async fn execute_sessions(orchestrator: &HealingOrchestrator, limit: i64) -> CliResult {
    let sessions = match orchestrator.recent_sessions(limit).await {
        Ok(s) => s,
        Err(e) => return CliResult::error(format!("Error loading sessions: {}\n", e)),
    };

    let mut output = String::new();
    output.push_str("\nHealing Sessions\n");
    output.push_str(RULE);

    if sessions.is_empty() {
        output.push_str("No healing sessions recorded.\n");
        return CliResult::success(output);
    }

    for session in &sessions {
        output.push_str(&format!(
            "{} | {:<21} | {:<18} | {:.2} | #{} | {}\n",
            session.created_at.format("%Y-%m-%d %H:%M:%S"),
            session.status,
            session.failure_type,
            session.confidence,
            session.attempt_number,
            session.id
        ));
    }

    CliResult::success(output)
}

async fn execute_session(orchestrator: &HealingOrchestrator, session_id: &str) -> CliResult {
    let session = match orchestrator.get_session(session_id).await {
        Ok(s) => s,
        Err(e) => return CliResult::error(format!("Error: {}\n", e)),
    };

    let mut output = String::new();
    output.push_str(&format!("\nHealing Session {}\n", session.id));
    output.push_str(RULE);
    output.push_str(&format!("Status:        {}\n", session.status));
    output.push_str(&format!("Failure type:  {}\n", session.failure_type));
    output.push_str(&format!("Confidence:    {:.2}\n", session.confidence));
    output.push_str(&format!("Attempt:       #{}\n", session.attempt_number));
    if let Some(parent) = &session.parent_session_id {
        output.push_str(&format!("Parent:        {}\n", parent));
    }
    if let Some(summary) = &session.failure_summary {
        output.push_str(&format!("Summary:       {}\n", summary));
    }
    if let Some(cause) = &session.root_cause {
        output.push_str(&format!("Root cause:    {}\n", cause));
    }
    if let Some(branch) = &session.fix_branch {
        output.push_str(&format!("Fix branch:    {}\n", branch));
    }
    if let Some(feedback) = &session.user_feedback {
        output.push_str(&format!("Feedback:      {}\n", feedback));
    }

    match orchestrator.fix_plan(session_id).await {
        Ok(Some(plan)) => {
            output.push_str("\nFix plan:\n");
            match serde_json::to_string_pretty(&plan) {
                Ok(json) => output.push_str(&json),
                Err(e) => output.push_str(&format!("  (unprintable: {})", e)),
            }
            output.push('\n');
        }
        Ok(None) => output.push_str("\nNo fix plan yet.\n"),
        Err(e) => output.push_str(&format!("\nFix plan unreadable: {}\n", e)),
    }

    CliResult::success(output)
}

async fn execute_audit(orchestrator: &HealingOrchestrator, session_id: &str) -> CliResult {
    let entries = match orchestrator.audit_log(session_id).await {
        Ok(e) => e,
        Err(e) => return CliResult::error(format!("Error: {}\n", e)),
    };

    let mut output = String::new();
    output.push_str(&format!("\nAudit Trail for {}\n", session_id));
    output.push_str(RULE);
    for entry in &entries {
        output.push_str(&format_audit(entry));
    }

    CliResult::success(output)
}

fn format_audit(entry: &AuditEntry) -> String {
    format!(
        "{} | {:<20} | {:<14} | {}\n",
        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
        entry.action,
        entry.actor,
        entry.note.as_deref().unwrap_or("-")
    )
}

async fn execute_stats(orchestrator: &HealingOrchestrator) -> CliResult {
    let stats = match orchestrator.healing_stats().await {
        Ok(s) => s,
        Err(e) => return CliResult::error(format!("Error loading statistics: {}\n", e)),
    };

    let mut output = String::new();
    output.push_str("\nHealing Statistics\n");
    output.push_str(RULE);
    output.push_str(&format!("Total sessions: {}\n", stats.total_sessions));
    match stats.mean_time_to_resolution_secs {
        Some(secs) => output.push_str(&format!("Mean time to resolution: {:.1}s\n", secs)),
        None => output.push_str("Mean time to resolution: n/a\n"),
    }

    output.push_str("\nBy status:\n");
    for (status, count) in &stats.by_status {
        output.push_str(&format!("  {:<22} {}\n", status, count));
    }
    output.push_str("\nBy failure type:\n");
    for (failure_type, count) in &stats.by_failure_type {
        output.push_str(&format!("  {:<22} {}\n", failure_type, count));
    }

    CliResult::success(output)
}

async fn execute_kb(orchestrator: &HealingOrchestrator, command: KbCommands) -> CliResult {
    let kb = orchestrator.knowledge();
    let mut output = String::new();

    match command {
        KbCommands::Stats => {
            let stats = match kb.get_stats().await {
                Ok(s) => s,
                Err(e) => return CliResult::error(format!("Error: {}\n", e)),
            };
            output.push_str("\nKnowledge Base\n");
            output.push_str(RULE);
            output.push_str(&format!("Patterns:           {}\n", stats.total_patterns));
            output.push_str(&format!("Fixes:              {}\n", stats.total_fixes));
            output.push_str(&format!("Average confidence: {:.3}\n", stats.average_confidence));
            if !stats.top_categories.is_empty() {
                output.push_str("\nTop categories:\n");
                for category in &stats.top_categories {
                    output.push_str(&format!(
                        "  {:<22} hits {:<5} avg {:.3}\n",
                        category.failure_type, category.hit_count, category.average_confidence
                    ));
                }
            }
        }
        KbCommands::Patterns { failure_type } => {
            let filter = match failure_type.map(|t| t.parse::<FailureType>()).transpose() {
                Ok(f) => f,
                Err(e) => return CliResult::error(e),
            };
            let patterns = match kb.list_patterns(filter).await {
                Ok(p) => p,
                Err(e) => return CliResult::error(format!("Error: {}\n", e)),
            };
            output.push_str("\nFailure Patterns\n");
            output.push_str(RULE);
            if patterns.is_empty() {
                output.push_str("No patterns recorded.\n");
            }
            for pattern in &patterns {
                output.push_str(&format!(
                    "{} | {:<18} | hits {:<4} | last {}\n",
                    pattern.id,
                    pattern.failure_type,
                    pattern.hit_count,
                    pattern.last_seen_at.format("%Y-%m-%d %H:%M:%S")
                ));
                if let Some(sample) = &pattern.sample_error {
                    let sample: String = sample.chars().take(100).collect();
                    output.push_str(&format!("    {}\n", sample.replace('\n', " ")));
                }
            }
        }
        KbCommands::Fixes { pattern_id } => {
            let fixes = match kb.fixes_for_pattern(&pattern_id).await {
                Ok(f) => f,
                Err(e) => return CliResult::error(format!("Error: {}\n", e)),
            };
            output.push_str(&format!("\nFixes for Pattern {}\n", pattern_id));
            output.push_str(RULE);
            if fixes.is_empty() {
                output.push_str("No fixes recorded.\n");
            }
            for fix in &fixes {
                output.push_str(&format!(
                    "{} | {:<14} | conf {:.3} | applied {} (✓ {} / ✗ {})\n",
                    fix.fix_id,
                    fix.fix_type,
                    fix.confidence,
                    fix.applied_count,
                    fix.success_count,
                    fix.failure_count
                ));
                if let Some(explanation) = &fix.explanation {
                    output.push_str(&format!("    {}\n", explanation));
                }
            }
        }
    }

    CliResult::success(output)
}

async fn execute_findings(orchestrator: &HealingOrchestrator, repo: &str, commit: &str) -> CliResult {
    let findings = match orchestrator.findings_for_commit(repo, commit).await {
        Ok(f) => f,
        Err(e) => return CliResult::error(format!("Error: {}\n", e)),
    };

    let mut output = String::new();
    output.push_str(&format!("\nSecurity Findings for {}@{}\n", repo, commit));
    output.push_str(RULE);
    if findings.is_empty() {
        output.push_str("No findings.\n");
    }
    for finding in &findings {
        output.push_str(&format!(
            "[{}] {} ({})\n",
            finding.severity, finding.title, finding.status
        ));
        output.push_str(&format!("    id: {}\n", finding.id));
        if let Some(cve) = &finding.vulnerability_id {
            output.push_str(&format!("    {}\n", cve));
        }
        output.push_str(&format!("    Remediation: {}\n", finding.remediation));
    }

    CliResult::success(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::storage::AuditAction;

    #[test]
    fn test_cli_result_codes() {
        assert_eq!(CliResult::success("ok").exit_code, 0);
        assert_eq!(CliResult::error("no").exit_code, 1);
    }

    #[test]
    fn test_format_audit_without_note() {
        let entry = AuditEntry {
            seq: 1,
            session_id: "s".to_string(),
            action: AuditAction::FixApproved,
            actor: "HUMAN".to_string(),
            note: None,
            created_at: Utc::now(),
        };
        let line = format_audit(&entry);
        assert!(line.contains("FIX_APPROVED"));
        assert!(line.trim_end().ends_with('-'));
    }
}
