use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

use super::{
    AuditAction, AuditEntry, FailureType, FindingStatus, FixType, HealingSession, HealingStats,
    HealingStatus, PipelineEvent, PipelineStatus, SecurityFinding, Severity, Storage,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory database (single connection so all callers share it)
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            }
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_pipeline_event(&self, event: &PipelineEvent) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_events (
                id, repo_url, repo_name, branch, commit_sha, provider, status,
                workflow_run_id, workflow_name, raw_logs, triggered_at, completed_at,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.repo_url)
        .bind(&event.repo_name)
        .bind(&event.branch)
        .bind(&event.commit_sha)
        .bind(&event.provider)
        .bind(event.status.as_str())
        .bind(&event.workflow_run_id)
        .bind(&event.workflow_name)
        .bind(&event.raw_logs)
        .bind(event.triggered_at.map(|t| t.to_rfc3339()))
        .bind(event.completed_at.map(|t| t.to_rfc3339()))
        .bind(event.created_at.to_rfc3339())
        .bind(event.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_pipeline_event(&self, id: &str) -> StorageResult<Option<PipelineEvent>> {
        let row: Option<PipelineEventRow> = sqlx::query_as(
            r#"
            SELECT id, repo_url, repo_name, branch, commit_sha, provider, status,
                   workflow_run_id, workflow_name, raw_logs, triggered_at, completed_at,
                   created_at, updated_at
            FROM pipeline_events
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PipelineEvent::try_from).transpose()
    }

    async fn update_pipeline_status(&self, id: &str, status: PipelineStatus) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_events
            SET status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "Pipeline event",
                id: id.to_string(),
            });
        }

        Ok(())
    }

    async fn create_healing_session(&self, session: &HealingSession) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO healing_sessions (
                id, pipeline_event_id, failure_type, failure_summary, root_cause,
                fix_explanation, fix_type, fix_plan_json, confidence, status, fix_branch,
                fix_commit_sha, attempt_number, parent_session_id, user_feedback,
                created_at, updated_at, resolved_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.pipeline_event_id)
        .bind(session.failure_type.as_str())
        .bind(&session.failure_summary)
        .bind(&session.root_cause)
        .bind(&session.fix_explanation)
        .bind(session.fix_type.map(|t| t.as_str()))
        .bind(&session.fix_plan_json)
        .bind(session.confidence)
        .bind(session.status.as_str())
        .bind(&session.fix_branch)
        .bind(&session.fix_commit_sha)
        .bind(session.attempt_number)
        .bind(&session.parent_session_id)
        .bind(&session.user_feedback)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .bind(session.resolved_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_healing_session(&self, id: &str) -> StorageResult<Option<HealingSession>> {
        let row: Option<HealingSessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM healing_sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(HealingSession::try_from).transpose()
    }

    async fn update_healing_session(&self, session: &HealingSession) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE healing_sessions
            SET failure_summary = ?, root_cause = ?, fix_explanation = ?, fix_type = ?,
                fix_plan_json = ?, confidence = ?, status = ?, fix_branch = ?,
                fix_commit_sha = ?, user_feedback = ?, updated_at = ?, resolved_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&session.failure_summary)
        .bind(&session.root_cause)
        .bind(&session.fix_explanation)
        .bind(session.fix_type.map(|t| t.as_str()))
        .bind(&session.fix_plan_json)
        .bind(session.confidence)
        .bind(session.status.as_str())
        .bind(&session.fix_branch)
        .bind(&session.fix_commit_sha)
        .bind(&session.user_feedback)
        .bind(session.updated_at.to_rfc3339())
        .bind(session.resolved_at.map(|t| t.to_rfc3339()))
        .bind(&session.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "Healing session",
                id: session.id.clone(),
            });
        }

        Ok(())
    }

    async fn list_recent_sessions(&self, limit: i64) -> StorageResult<Vec<HealingSession>> {
        let rows: Vec<HealingSessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM healing_sessions ORDER BY created_at DESC LIMIT ?",
            SESSION_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(HealingSession::try_from).collect()
    }

    async fn find_session_by_fix_branch(
        &self,
        repo_name: &str,
        branch: &str,
    ) -> StorageResult<Option<HealingSession>> {
        let row: Option<HealingSessionRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.pipeline_event_id, s.failure_type, s.failure_summary, s.root_cause,
                   s.fix_explanation, s.fix_type, s.fix_plan_json, s.confidence, s.status,
                   s.fix_branch, s.fix_commit_sha, s.attempt_number, s.parent_session_id,
                   s.user_feedback, s.created_at, s.updated_at, s.resolved_at
            FROM healing_sessions s
            JOIN pipeline_events e ON e.id = s.pipeline_event_id
            WHERE e.repo_name = ? AND s.fix_branch = ?
            ORDER BY s.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(repo_name)
        .bind(branch)
        .fetch_optional(&self.pool)
        .await?;

        row.map(HealingSession::try_from).transpose()
    }

    async fn healing_stats(&self) -> StorageResult<HealingStats> {
        let total_sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM healing_sessions")
            .fetch_one(&self.pool)
            .await?;

        let by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM healing_sessions GROUP BY status ORDER BY COUNT(*) DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let by_failure_type: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT failure_type, COUNT(*) FROM healing_sessions
            GROUP BY failure_type ORDER BY COUNT(*) DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let resolved: Vec<(String, String)> = sqlx::query_as(
            "SELECT created_at, resolved_at FROM healing_sessions WHERE resolved_at IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let durations: Vec<f64> = resolved
            .iter()
            .filter_map(|(created, resolved)| {
                let created = parse_timestamp(created).ok()?;
                let resolved = parse_timestamp(resolved).ok()?;
                Some((resolved - created).num_milliseconds() as f64 / 1000.0)
            })
            .collect();

        let mean_time_to_resolution_secs = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<f64>() / durations.len() as f64)
        };

        Ok(HealingStats {
            total_sessions,
            by_status,
            by_failure_type,
            mean_time_to_resolution_secs,
        })
    }

    async fn append_audit(
        &self,
        session_id: &str,
        action: AuditAction,
        actor: &str,
        note: Option<&str>,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fix_audit_log (session_id, action, actor, note, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(action.as_str())
        .bind(actor)
        .bind(note)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_audit_log(&self, session_id: &str) -> StorageResult<Vec<AuditEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            r#"
            SELECT seq, session_id, action, actor, note, created_at
            FROM fix_audit_log
            WHERE session_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditEntry::try_from).collect()
    }

    async fn count_findings_for_commit(
        &self,
        repo_name: &str,
        commit_sha: &str,
    ) -> StorageResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM security_findings WHERE repo_name = ? AND commit_sha = ?",
        )
        .bind(repo_name)
        .bind(commit_sha)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn create_security_findings(&self, findings: &[SecurityFinding]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        for finding in findings {
            sqlx::query(
                r#"
                INSERT INTO security_findings (
                    id, pipeline_event_id, repo_name, branch, commit_sha, scan_provider,
                    severity, vulnerability_type, vulnerability_id, title, description,
                    remediation, file_path, line_number, status, raw_finding,
                    created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&finding.id)
            .bind(&finding.pipeline_event_id)
            .bind(&finding.repo_name)
            .bind(&finding.branch)
            .bind(&finding.commit_sha)
            .bind(&finding.scan_provider)
            .bind(finding.severity.as_str())
            .bind(&finding.vulnerability_type)
            .bind(&finding.vulnerability_id)
            .bind(&finding.title)
            .bind(&finding.description)
            .bind(&finding.remediation)
            .bind(&finding.file_path)
            .bind(finding.line_number)
            .bind(finding.status.as_str())
            .bind(&finding.raw_finding)
            .bind(finding.created_at.to_rfc3339())
            .bind(finding.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_findings_for_commit(
        &self,
        repo_name: &str,
        commit_sha: &str,
    ) -> StorageResult<Vec<SecurityFinding>> {
        let rows: Vec<SecurityFindingRow> = sqlx::query_as(
            r#"
            SELECT id, pipeline_event_id, repo_name, branch, commit_sha, scan_provider,
                   severity, vulnerability_type, vulnerability_id, title, description,
                   remediation, file_path, line_number, status, raw_finding,
                   created_at, updated_at
            FROM security_findings
            WHERE repo_name = ? AND commit_sha = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(repo_name)
        .bind(commit_sha)
        .fetch_all(&self.pool)
        .await?;

        let mut findings = rows
            .into_iter()
            .map(SecurityFinding::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        findings.sort_by_key(|f| f.severity);
        Ok(findings)
    }

    async fn update_finding_status(&self, id: &str, status: FindingStatus) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE security_findings SET status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "Security finding",
                id: id.to_string(),
            });
        }

        Ok(())
    }
}

const SESSION_COLUMNS: &str = "id, pipeline_event_id, failure_type, failure_summary, root_cause, \
    fix_explanation, fix_type, fix_plan_json, confidence, status, fix_branch, fix_commit_sha, \
    attempt_number, parent_session_id, user_feedback, created_at, updated_at, resolved_at";

/// Parse an RFC 3339 column value.
pub(crate) fn parse_timestamp(value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Query {
            message: format!("Invalid timestamp '{}': {}", value, e),
        })
}

pub(crate) fn parse_optional_timestamp(value: Option<String>) -> StorageResult<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

pub(crate) fn parse_enum<T: FromStr<Err = String>>(value: &str) -> StorageResult<T> {
    value
        .parse()
        .map_err(|message: String| StorageError::Query { message })
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct PipelineEventRow {
    id: String,
    repo_url: Option<String>,
    repo_name: String,
    branch: String,
    commit_sha: String,
    provider: String,
    status: String,
    workflow_run_id: Option<String>,
    workflow_name: Option<String>,
    raw_logs: Option<String>,
    triggered_at: Option<String>,
    completed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<PipelineEventRow> for PipelineEvent {
    type Error = StorageError;

    fn try_from(row: PipelineEventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            repo_url: row.repo_url,
            repo_name: row.repo_name,
            branch: row.branch,
            commit_sha: row.commit_sha,
            provider: row.provider,
            status: parse_enum::<PipelineStatus>(&row.status)?,
            workflow_run_id: row.workflow_run_id,
            workflow_name: row.workflow_name,
            raw_logs: row.raw_logs,
            triggered_at: parse_optional_timestamp(row.triggered_at)?,
            completed_at: parse_optional_timestamp(row.completed_at)?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HealingSessionRow {
    id: String,
    pipeline_event_id: String,
    failure_type: String,
    failure_summary: Option<String>,
    root_cause: Option<String>,
    fix_explanation: Option<String>,
    fix_type: Option<String>,
    fix_plan_json: Option<String>,
    confidence: f64,
    status: String,
    fix_branch: Option<String>,
    fix_commit_sha: Option<String>,
    attempt_number: i64,
    parent_session_id: Option<String>,
    user_feedback: Option<String>,
    created_at: String,
    updated_at: String,
    resolved_at: Option<String>,
}

impl TryFrom<HealingSessionRow> for HealingSession {
    type Error = StorageError;

    fn try_from(row: HealingSessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            pipeline_event_id: row.pipeline_event_id,
            failure_type: parse_enum::<FailureType>(&row.failure_type)?,
            failure_summary: row.failure_summary,
            root_cause: row.root_cause,
            fix_explanation: row.fix_explanation,
            fix_type: row
                .fix_type
                .as_deref()
                .map(parse_enum::<FixType>)
                .transpose()?,
            fix_plan_json: row.fix_plan_json,
            confidence: row.confidence,
            status: parse_enum::<HealingStatus>(&row.status)?,
            fix_branch: row.fix_branch,
            fix_commit_sha: row.fix_commit_sha,
            attempt_number: row.attempt_number,
            parent_session_id: row.parent_session_id,
            user_feedback: row.user_feedback,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            resolved_at: parse_optional_timestamp(row.resolved_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    seq: i64,
    session_id: String,
    action: String,
    actor: String,
    note: Option<String>,
    created_at: String,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = StorageError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(Self {
            seq: row.seq,
            session_id: row.session_id,
            action: parse_enum::<AuditAction>(&row.action)?,
            actor: row.actor,
            note: row.note,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SecurityFindingRow {
    id: String,
    pipeline_event_id: Option<String>,
    repo_name: String,
    branch: String,
    commit_sha: String,
    scan_provider: String,
    severity: String,
    vulnerability_type: String,
    vulnerability_id: Option<String>,
    title: String,
    description: String,
    remediation: String,
    file_path: Option<String>,
    line_number: Option<i64>,
    status: String,
    raw_finding: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<SecurityFindingRow> for SecurityFinding {
    type Error = StorageError;

    fn try_from(row: SecurityFindingRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            pipeline_event_id: row.pipeline_event_id,
            repo_name: row.repo_name,
            branch: row.branch,
            commit_sha: row.commit_sha,
            scan_provider: row.scan_provider,
            severity: parse_enum::<Severity>(&row.severity)?,
            vulnerability_type: row.vulnerability_type,
            vulnerability_id: row.vulnerability_id,
            title: row.title,
            description: row.description,
            remediation: row.remediation,
            file_path: row.file_path,
            line_number: row.line_number,
            status: parse_enum::<FindingStatus>(&row.status)?,
            raw_finding: row.raw_finding,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}
