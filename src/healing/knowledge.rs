//! Confidence-weighted fix cache.
//!
//! Failure patterns are keyed by `(failure_type, error_signature)`. Each
//! stored fix is immutable and hangs off its pattern through a relationship
//! row carrying the outcome statistics. Confidence starts at the generator's
//! self-reported score and is replaced by the Laplace-smoothed success rate
//! as soon as the first outcome is recorded.
//!
//! # Database Tables
//!
//! Uses tables from `migrations/20250101000002_knowledge_tables.sql`:
//! - `failure_patterns` - Signatures and hit counts
//! - `fixes` - Immutable fix payloads
//! - `fix_relationships` - Per pattern/fix outcome statistics
//! - `fix_applications` - Which fix a healing session used
//!
//! Outcome counters are updated with a single `UPDATE ... RETURNING`
//! statement, so concurrent recordings never lose an increment. Lookups that
//! race with an update may read the previous confidence.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::normalizer::{error_signature, SIGNATURE_PREFIX_CHARS};
use super::plan::FixPlan;
use crate::config::KnowledgeConfig;
use crate::error::{StorageError, StorageResult};
use crate::storage::{
    parse_enum, parse_optional_timestamp, parse_timestamp, FailureType, FixType, HealingSession,
};

/// Reason attached to every plan served from the cache.
pub const KNOWLEDGE_BASE_REASON: &str = "Retrieved from knowledge base";

/// Laplace-smoothed success rate.
///
/// Always strictly inside (0, 1), and 0.5 before any observation.
pub fn laplace_confidence(success_count: i64, applied_count: i64) -> f64 {
    (success_count as f64 + 1.0) / (applied_count as f64 + 2.0)
}

// ============================================================================
// Types
// ============================================================================

/// How a cached fix was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    /// Same error signature.
    Exact,
    /// Best fix for the failure category across all signatures.
    Category,
}

/// A plan served from the knowledge base.
#[derive(Debug, Clone)]
pub struct CachedFix {
    pub fix_id: String,
    pub pattern_id: String,
    /// Relationship confidence at lookup time.
    pub confidence: f64,
    pub success_count: i64,
    pub source: CacheSource,
    /// Stored plan with confidence and reason rewritten for the cache hit.
    pub plan: FixPlan,
}

/// Relationship counters after an outcome was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct OutcomeStats {
    pub fix_id: String,
    pub pattern_id: String,
    pub confidence: f64,
    pub applied_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
}

/// One failure pattern node.
#[derive(Debug, Clone, Serialize)]
pub struct FailurePattern {
    pub id: String,
    pub failure_type: FailureType,
    pub error_signature: String,
    pub sample_error: Option<String>,
    pub hit_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// A fix attached to a pattern, with its statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PatternFix {
    pub fix_id: String,
    pub fix_type: FixType,
    pub explanation: Option<String>,
    pub initial_confidence: f64,
    pub confidence: f64,
    pub applied_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub healing_session_id: Option<String>,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Per-category aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CategoryStats {
    pub failure_type: String,
    pub hit_count: i64,
    pub average_confidence: f64,
}

/// Knowledge base aggregates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeStats {
    pub total_patterns: i64,
    pub total_fixes: i64,
    /// Mean confidence over all relationships, 0.0 when empty.
    pub average_confidence: f64,
    /// Top ten categories by hit count.
    pub top_categories: Vec<CategoryStats>,
}

#[derive(sqlx::FromRow)]
struct CachedRow {
    fix_id: String,
    pattern_id: String,
    confidence: f64,
    success_count: i64,
    plan_json: String,
}

#[derive(sqlx::FromRow)]
struct PatternRow {
    id: String,
    failure_type: String,
    error_signature: String,
    sample_error: Option<String>,
    hit_count: i64,
    created_at: String,
    last_seen_at: String,
}

impl TryFrom<PatternRow> for FailurePattern {
    type Error = StorageError;

    fn try_from(row: PatternRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            failure_type: parse_enum(&row.failure_type)?,
            error_signature: row.error_signature,
            sample_error: row.sample_error,
            hit_count: row.hit_count,
            created_at: parse_timestamp(&row.created_at)?,
            last_seen_at: parse_timestamp(&row.last_seen_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PatternFixRow {
    fix_id: String,
    fix_type: String,
    explanation: Option<String>,
    initial_confidence: f64,
    confidence: f64,
    applied_count: i64,
    success_count: i64,
    failure_count: i64,
    healing_session_id: Option<String>,
    last_applied_at: Option<String>,
    created_at: String,
}

impl TryFrom<PatternFixRow> for PatternFix {
    type Error = StorageError;

    fn try_from(row: PatternFixRow) -> Result<Self, Self::Error> {
        Ok(Self {
            fix_id: row.fix_id,
            fix_type: parse_enum(&row.fix_type)?,
            explanation: row.explanation,
            initial_confidence: row.initial_confidence,
            confidence: row.confidence,
            applied_count: row.applied_count,
            success_count: row.success_count,
            failure_count: row.failure_count,
            healing_session_id: row.healing_session_id,
            last_applied_at: parse_optional_timestamp(row.last_applied_at)?,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

// ============================================================================
// Knowledge base
// ============================================================================

/// Fix cache over the shared SQLite pool.
#[derive(Clone)]
pub struct KnowledgeBase {
    pool: SqlitePool,
    config: KnowledgeConfig,
}

impl KnowledgeBase {
    /// Create a knowledge base from an existing (migrated) pool.
    pub fn new(pool: SqlitePool, config: KnowledgeConfig) -> Self {
        Self { pool, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Look up a reusable plan for a failure.
    ///
    /// Exact signature matches must clear both the confidence and the
    /// success-count thresholds. Otherwise the best fix for the category by
    /// success count among those above the confidence threshold is used, and
    /// its plan is capped at `min_confidence` since it was written for a
    /// different error.
    pub async fn find_cached_fix(
        &self,
        failure_type: FailureType,
        repo_name: &str,
        raw_logs: &str,
    ) -> StorageResult<Option<CachedFix>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let signature = error_signature(failure_type, raw_logs);

        let exact: Option<CachedRow> = sqlx::query_as(
            r#"
            SELECT r.fix_id, r.pattern_id, r.confidence, r.success_count, f.plan_json
            FROM failure_patterns p
            JOIN fix_relationships r ON r.pattern_id = p.id
            JOIN fixes f ON f.id = r.fix_id
            WHERE p.failure_type = ? AND p.error_signature = ?
              AND r.confidence >= ? AND r.success_count >= ?
            ORDER BY r.confidence DESC, r.success_count DESC, r.created_at ASC
            LIMIT 1
            "#,
        )
        .bind(failure_type.as_str())
        .bind(&signature)
        .bind(self.config.min_confidence)
        .bind(self.config.min_success_count)
        .fetch_optional(&self.pool)
        .await?;

        let min_confidence = self.config.min_confidence;

        if let Some(hit) = exact.and_then(|row| into_cached(row, CacheSource::Exact, min_confidence)) {
            info!(
                failure_type = %failure_type,
                repo = %repo_name,
                confidence = hit.confidence,
                "Knowledge base hit (exact signature)"
            );
            return Ok(Some(hit));
        }

        let by_category: Option<CachedRow> = sqlx::query_as(
            r#"
            SELECT r.fix_id, r.pattern_id, r.confidence, r.success_count, f.plan_json
            FROM failure_patterns p
            JOIN fix_relationships r ON r.pattern_id = p.id
            JOIN fixes f ON f.id = r.fix_id
            WHERE p.failure_type = ? AND r.confidence >= ?
            ORDER BY r.success_count DESC, r.confidence DESC, r.created_at ASC
            LIMIT 1
            "#,
        )
        .bind(failure_type.as_str())
        .bind(self.config.min_confidence)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(hit) =
            by_category.and_then(|row| into_cached(row, CacheSource::Category, min_confidence))
        {
            info!(
                failure_type = %failure_type,
                repo = %repo_name,
                confidence = hit.confidence,
                "Knowledge base hit (failure category)"
            );
            return Ok(Some(hit));
        }

        info!(failure_type = %failure_type, repo = %repo_name, "Knowledge base miss");
        Ok(None)
    }

    /// Persist a freshly generated plan and link it to the session.
    ///
    /// Returns the new fix id.
    pub async fn store_fix(
        &self,
        session: &HealingSession,
        repo_name: &str,
        plan: &FixPlan,
        raw_logs: &str,
    ) -> StorageResult<String> {
        let signature = error_signature(session.failure_type, raw_logs);
        let sample: String = raw_logs.chars().take(SIGNATURE_PREFIX_CHARS).collect();
        let now = Utc::now().to_rfc3339();

        let plan_json = serde_json::to_string(plan).map_err(|e| StorageError::Query {
            message: format!("Failed to serialize fix plan: {}", e),
        })?;
        let file_changes_json =
            serde_json::to_string(&plan.files_to_modify).map_err(|e| StorageError::Query {
                message: format!("Failed to serialize file changes: {}", e),
            })?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO failure_patterns (
                id, failure_type, error_signature, sample_error, hit_count,
                created_at, last_seen_at
            ) VALUES (?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(failure_type, error_signature) DO UPDATE SET
                hit_count = hit_count + 1,
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(session.failure_type.as_str())
        .bind(&signature)
        .bind(&sample)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let pattern_id: String = sqlx::query_scalar(
            "SELECT id FROM failure_patterns WHERE failure_type = ? AND error_signature = ?",
        )
        .bind(session.failure_type.as_str())
        .bind(&signature)
        .fetch_one(&mut *tx)
        .await?;

        let fix_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO fixes (
                id, fix_type, explanation, plan_json, file_changes_json,
                initial_confidence, healing_session_id, repo_name, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&fix_id)
        .bind(plan.fix_type.as_str())
        .bind(&plan.fix_explanation)
        .bind(&plan_json)
        .bind(&file_changes_json)
        .bind(plan.confidence_score)
        .bind(&session.id)
        .bind(repo_name)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO fix_relationships (
                id, pattern_id, fix_id, confidence,
                applied_count, success_count, failure_count, created_at
            ) VALUES (?, ?, ?, ?, 0, 0, 0, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&pattern_id)
        .bind(&fix_id)
        .bind(plan.confidence_score)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        link(&mut *tx, &session.id, &fix_id).await?;

        tx.commit().await?;

        info!(
            session_id = %session.id,
            fix_id = %fix_id,
            failure_type = %session.failure_type,
            confidence = plan.confidence_score,
            "Stored fix in knowledge base"
        );
        Ok(fix_id)
    }

    /// Record that `session_id` used an existing fix.
    pub async fn link_session(&self, session_id: &str, fix_id: &str) -> StorageResult<()> {
        link(&self.pool, session_id, fix_id).await?;
        debug!(session_id = %session_id, fix_id = %fix_id, "Linked session to cached fix");
        Ok(())
    }

    /// Fold one pipeline outcome into the statistics of the session's fix.
    ///
    /// Returns `None` when the session never used a stored fix.
    pub async fn record_outcome(
        &self,
        session_id: &str,
        success: bool,
    ) -> StorageResult<Option<OutcomeStats>> {
        let (success_inc, failure_inc) = if success { (1_i64, 0_i64) } else { (0, 1) };

        // Right-hand sides see pre-update values
        let stats: Option<OutcomeStats> = sqlx::query_as(
            r#"
            UPDATE fix_relationships
            SET success_count = success_count + ?,
                failure_count = failure_count + ?,
                applied_count = applied_count + 1,
                confidence = (success_count + ? + 1.0) / (applied_count + 1 + 2.0),
                last_applied_at = ?
            WHERE fix_id = (SELECT fix_id FROM fix_applications WHERE session_id = ?)
            RETURNING fix_id, pattern_id, confidence, applied_count, success_count, failure_count
            "#,
        )
        .bind(success_inc)
        .bind(failure_inc)
        .bind(success_inc)
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        match &stats {
            Some(s) => info!(
                session_id = %session_id,
                fix_id = %s.fix_id,
                success,
                applied = s.applied_count,
                confidence = format!("{:.4}", s.confidence),
                "Recorded fix outcome"
            ),
            None => warn!(session_id = %session_id, "No stored fix linked to session"),
        }

        Ok(stats)
    }

    /// Aggregate counts and per-category confidence.
    pub async fn get_stats(&self) -> StorageResult<KnowledgeStats> {
        let total_patterns: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM failure_patterns")
            .fetch_one(&self.pool)
            .await?;
        let total_fixes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fixes")
            .fetch_one(&self.pool)
            .await?;
        let average_confidence: f64 =
            sqlx::query_scalar("SELECT COALESCE(AVG(confidence), 0.0) FROM fix_relationships")
                .fetch_one(&self.pool)
                .await?;

        let top_categories: Vec<CategoryStats> = sqlx::query_as(
            r#"
            SELECT p.failure_type AS failure_type,
                   SUM(p.hit_count) AS hit_count,
                   COALESCE((
                       SELECT AVG(r.confidence)
                       FROM fix_relationships r
                       JOIN failure_patterns q ON q.id = r.pattern_id
                       WHERE q.failure_type = p.failure_type
                   ), 0.0) AS average_confidence
            FROM failure_patterns p
            GROUP BY p.failure_type
            ORDER BY hit_count DESC, p.failure_type ASC
            LIMIT 10
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(KnowledgeStats {
            total_patterns,
            total_fixes,
            average_confidence,
            top_categories,
        })
    }

    /// Patterns ordered by hit count, optionally for one category.
    pub async fn list_patterns(
        &self,
        failure_type: Option<FailureType>,
    ) -> StorageResult<Vec<FailurePattern>> {
        let rows: Vec<PatternRow> = sqlx::query_as(
            r#"
            SELECT id, failure_type, error_signature, sample_error, hit_count,
                   created_at, last_seen_at
            FROM failure_patterns
            WHERE ? IS NULL OR failure_type = ?
            ORDER BY hit_count DESC, last_seen_at DESC
            "#,
        )
        .bind(failure_type.map(|t| t.as_str()))
        .bind(failure_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FailurePattern::try_from).collect()
    }

    /// Fixes attached to a pattern, best first.
    pub async fn fixes_for_pattern(&self, pattern_id: &str) -> StorageResult<Vec<PatternFix>> {
        let rows: Vec<PatternFixRow> = sqlx::query_as(
            r#"
            SELECT f.id AS fix_id, f.fix_type, f.explanation, f.initial_confidence,
                   r.confidence, r.applied_count, r.success_count, r.failure_count,
                   f.healing_session_id, r.last_applied_at, f.created_at
            FROM fix_relationships r
            JOIN fixes f ON f.id = r.fix_id
            WHERE r.pattern_id = ?
            ORDER BY r.confidence DESC, r.success_count DESC
            "#,
        )
        .bind(pattern_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PatternFix::try_from).collect()
    }
}

async fn link<'e, E>(executor: E, session_id: &str, fix_id: &str) -> StorageResult<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO fix_applications (session_id, fix_id, created_at)
        VALUES (?, ?, ?)
        ON CONFLICT(session_id) DO UPDATE SET fix_id = excluded.fix_id
        "#,
    )
    .bind(session_id)
    .bind(fix_id)
    .bind(Utc::now().to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

fn into_cached(row: CachedRow, source: CacheSource, min_confidence: f64) -> Option<CachedFix> {
    let mut plan = match FixPlan::from_json(&row.plan_json) {
        Ok(plan) => plan,
        Err(e) => {
            warn!(fix_id = %row.fix_id, error = %e, "Skipping unreadable cached fix");
            return None;
        }
    };
    plan.confidence_score = match source {
        CacheSource::Exact => row.confidence,
        CacheSource::Category => row.confidence.min(min_confidence),
    };
    plan.human_readable_reason = KNOWLEDGE_BASE_REASON.to_string();

    Some(CachedFix {
        fix_id: row.fix_id,
        pattern_id: row.pattern_id,
        confidence: row.confidence,
        success_count: row.success_count,
        source,
        plan,
    })
}
