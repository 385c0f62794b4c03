use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Transaction;
use std::str::FromStr;
use tracing::{debug, info};

use super::{
    CalibrationSnapshot, ComparisonPost, CycleStatus, CycleTrigger, DiscoveredRule,
    FollowUpQuestion, ImprovementCycle, OutcomeRecord, Storage, Variant, VariantSource,
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

    /// Create an in-memory database with migrations applied.
    ///
    /// The pool holds a single connection that never expires, since every
    /// new connection to `:memory:` would see an empty database.
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

    /// Close every connection. Subsequent queries fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization {
        message: e.to_string(),
    })
}

/// Take the write lock on an outcome row and read it.
///
/// The no-op write comes first so concurrent read-modify-write transactions
/// queue on the lock instead of both reading the same previous value.
async fn lock_outcome(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
) -> StorageResult<OutcomeRecord> {
    let locked = sqlx::query("UPDATE outcomes SET id = id WHERE id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    if locked.rows_affected() == 0 {
        return Err(StorageError::NotFound {
            entity: "Outcome",
            id: id.to_string(),
        });
    }

    let row: OutcomeRow = sqlx::query_as("SELECT * FROM outcomes WHERE id = ?")
        .bind(id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(row.into())
}

#[async_trait]
impl Storage for SqliteStorage {
    // ------------------------------------------------------------------
    // Variants
    // ------------------------------------------------------------------

    async fn insert_variant(&self, variant: &Variant) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO variants (
                version, parent_version, cohort, text, traffic_pct, is_active, is_candidate,
                source, sample_size, avg_score, rating_count, avg_user_rating, helpful_count,
                helpful_votes, community_delta_count, avg_community_delta, source_rule_ids,
                promoted_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&variant.version)
        .bind(&variant.parent_version)
        .bind(&variant.cohort)
        .bind(&variant.text)
        .bind(variant.traffic_pct)
        .bind(variant.is_active)
        .bind(variant.is_candidate)
        .bind(variant.source.as_str())
        .bind(variant.sample_size)
        .bind(variant.avg_score)
        .bind(variant.rating_count)
        .bind(variant.avg_user_rating)
        .bind(variant.helpful_count)
        .bind(variant.helpful_votes)
        .bind(variant.community_delta_count)
        .bind(variant.avg_community_delta)
        .bind(to_json(&variant.source_rule_ids)?)
        .bind(variant.promoted_at.map(ts))
        .bind(ts(variant.created_at))
        .execute(&self.pool)
        .await?;

        debug!(version = %variant.version, traffic_pct = variant.traffic_pct, "Variant inserted");
        Ok(())
    }

    async fn get_variant(&self, version: &str) -> StorageResult<Option<Variant>> {
        let row: Option<VariantRow> = sqlx::query_as(
            r#"
            SELECT * FROM variants WHERE version = ?
            "#,
        )
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn list_variants(&self) -> StorageResult<Vec<Variant>> {
        let rows: Vec<VariantRow> = sqlx::query_as(
            r#"
            SELECT * FROM variants ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn active_variants(&self, cohort: Option<&str>) -> StorageResult<Vec<Variant>> {
        let rows: Vec<VariantRow> = sqlx::query_as(
            r#"
            SELECT * FROM variants
            WHERE is_active = 1 AND cohort IS ?
            ORDER BY traffic_pct DESC, created_at ASC, rowid ASC
            "#,
        )
        .bind(cohort)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn active_candidates(&self) -> StorageResult<Vec<Variant>> {
        let rows: Vec<VariantRow> = sqlx::query_as(
            r#"
            SELECT * FROM variants
            WHERE is_active = 1 AND is_candidate = 1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn count_children(&self, parent: &str) -> StorageResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM variants WHERE parent_version = ?")
                .bind(parent)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    async fn count_cohort_variants_since(
        &self,
        cohort: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM variants WHERE cohort = ? AND created_at >= ?",
        )
        .bind(cohort)
        .bind(ts(since))
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn retire_cohort_variants(&self, cohort: &str, keep: &str) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE variants
            SET is_active = 0, traffic_pct = 0
            WHERE cohort = ? AND version != ? AND is_active = 1
            "#,
        )
        .bind(cohort)
        .bind(keep)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn set_variant_state(
        &self,
        version: &str,
        is_active: bool,
        is_candidate: bool,
        traffic_pct: i64,
        promoted_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE variants
            SET is_active = ?, is_candidate = ?, traffic_pct = ?,
                promoted_at = COALESCE(?, promoted_at)
            WHERE version = ?
            "#,
        )
        .bind(is_active)
        .bind(is_candidate)
        .bind(traffic_pct.clamp(0, 100))
        .bind(promoted_at.map(ts))
        .bind(version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "Variant",
                id: version.to_string(),
            });
        }

        Ok(())
    }

    async fn set_traffic(&self, version: &str, traffic_pct: i64) -> StorageResult<()> {
        let result = sqlx::query("UPDATE variants SET traffic_pct = ? WHERE version = ?")
            .bind(traffic_pct.clamp(0, 100))
            .bind(version)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "Variant",
                id: version.to_string(),
            });
        }

        Ok(())
    }

    async fn record_variant_score(&self, version: &str, score: f64) -> StorageResult<bool> {
        // SET expressions all read the pre-update row, so this is one atomic fold.
        let result = sqlx::query(
            r#"
            UPDATE variants
            SET avg_score = CASE
                    WHEN avg_score IS NULL OR sample_size = 0 THEN ?
                    ELSE (avg_score * sample_size + ?) / (sample_size + 1)
                END,
                sample_size = sample_size + 1
            WHERE version = ?
            "#,
        )
        .bind(score)
        .bind(score)
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_variant_rating(
        &self,
        version: &str,
        rating: Option<f64>,
        helpful: Option<bool>,
    ) -> StorageResult<bool> {
        let mut touched = false;

        if let Some(rating) = rating {
            let result = sqlx::query(
                r#"
                UPDATE variants
                SET avg_user_rating = CASE
                        WHEN avg_user_rating IS NULL OR rating_count = 0 THEN ?
                        ELSE (avg_user_rating * rating_count + ?) / (rating_count + 1)
                    END,
                    rating_count = rating_count + 1
                WHERE version = ?
                "#,
            )
            .bind(rating)
            .bind(rating)
            .bind(version)
            .execute(&self.pool)
            .await?;
            touched |= result.rows_affected() > 0;
        }

        if let Some(helpful) = helpful {
            let result = sqlx::query(
                r#"
                UPDATE variants
                SET helpful_votes = helpful_votes + 1,
                    helpful_count = helpful_count + ?
                WHERE version = ?
                "#,
            )
            .bind(if helpful { 1_i64 } else { 0_i64 })
            .bind(version)
            .execute(&self.pool)
            .await?;
            touched |= result.rows_affected() > 0;
        }

        Ok(touched)
    }

    async fn record_variant_delta(&self, version: &str, delta: f64) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE variants
            SET avg_community_delta = CASE
                    WHEN avg_community_delta IS NULL OR community_delta_count = 0 THEN ?
                    ELSE (avg_community_delta * community_delta_count + ?) / (community_delta_count + 1)
                END,
                community_delta_count = community_delta_count + 1
            WHERE version = ?
            "#,
        )
        .bind(delta)
        .bind(delta)
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn replace_variant_rating(
        &self,
        version: &str,
        previous: f64,
        rating: f64,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE variants
            SET avg_user_rating = CASE
                    WHEN avg_user_rating IS NULL OR rating_count = 0 THEN ?
                    ELSE avg_user_rating + (? - ?) / rating_count
                END,
                rating_count = MAX(rating_count, 1)
            WHERE version = ?
            "#,
        )
        .bind(rating)
        .bind(rating)
        .bind(previous)
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn replace_variant_helpful(
        &self,
        version: &str,
        previous: bool,
        helpful: bool,
    ) -> StorageResult<bool> {
        let shift = i64::from(helpful) - i64::from(previous);
        let result = sqlx::query(
            r#"
            UPDATE variants
            SET helpful_count = MIN(MAX(helpful_count + ?, 0), helpful_votes)
            WHERE version = ?
            "#,
        )
        .bind(shift)
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn replace_variant_delta(
        &self,
        version: &str,
        previous: f64,
        delta: Option<f64>,
    ) -> StorageResult<bool> {
        let result = match delta {
            Some(delta) => {
                sqlx::query(
                    r#"
                    UPDATE variants
                    SET avg_community_delta = CASE
                            WHEN avg_community_delta IS NULL OR community_delta_count = 0 THEN ?
                            ELSE avg_community_delta + (? - ?) / community_delta_count
                        END,
                        community_delta_count = MAX(community_delta_count, 1)
                    WHERE version = ?
                    "#,
                )
                .bind(delta)
                .bind(delta)
                .bind(previous)
                .bind(version)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE variants
                    SET avg_community_delta = CASE
                            WHEN community_delta_count <= 1 THEN NULL
                            ELSE (avg_community_delta * community_delta_count - ?)
                                / (community_delta_count - 1)
                        END,
                        community_delta_count = MAX(community_delta_count - 1, 0)
                    WHERE version = ?
                    "#,
                )
                .bind(previous)
                .bind(version)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() > 0)
    }

    async fn promote_variant(
        &self,
        candidate: &str,
        control: Option<&str>,
        promoted_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(control) = control {
            sqlx::query(
                "UPDATE variants SET is_active = 0, is_candidate = 0, traffic_pct = 0 WHERE version = ?",
            )
            .bind(control)
            .execute(&mut *tx)
            .await?;
        }

        let result = sqlx::query(
            r#"
            UPDATE variants
            SET is_active = 1, is_candidate = 0, traffic_pct = 100, promoted_at = ?
            WHERE version = ?
            "#,
        )
        .bind(ts(promoted_at))
        .bind(candidate)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Dropping the transaction rolls back the control update
            return Err(StorageError::NotFound {
                entity: "Variant",
                id: candidate.to_string(),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outcomes
    // ------------------------------------------------------------------

    async fn insert_outcome(&self, outcome: &OutcomeRecord) -> StorageResult<()> {
        let profile = match &outcome.profile {
            Some(p) => Some(to_json(p)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO outcomes (
                id, variant_version, user_id, score, user_rating, helpful, community_avg,
                community_count, categories, profile, is_fallback, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&outcome.id)
        .bind(&outcome.variant_version)
        .bind(&outcome.user_id)
        .bind(outcome.score)
        .bind(outcome.user_rating)
        .bind(outcome.helpful)
        .bind(outcome.community_avg)
        .bind(outcome.community_count)
        .bind(to_json(&outcome.categories)?)
        .bind(profile)
        .bind(outcome.is_fallback)
        .bind(ts(outcome.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_outcome(&self, id: &str) -> StorageResult<Option<OutcomeRecord>> {
        let row: Option<OutcomeRow> = sqlx::query_as("SELECT * FROM outcomes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn update_outcome_feedback(
        &self,
        id: &str,
        rating: Option<i64>,
        helpful: Option<bool>,
    ) -> StorageResult<OutcomeRecord> {
        let mut tx = self.pool.begin().await?;
        let previous = lock_outcome(&mut tx, id).await?;

        sqlx::query(
            r#"
            UPDATE outcomes
            SET user_rating = COALESCE(?, user_rating), helpful = COALESCE(?, helpful)
            WHERE id = ?
            "#,
        )
        .bind(rating)
        .bind(helpful)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(previous)
    }

    async fn update_outcome_community(
        &self,
        id: &str,
        avg: f64,
        count: i64,
    ) -> StorageResult<OutcomeRecord> {
        let mut tx = self.pool.begin().await?;
        let previous = lock_outcome(&mut tx, id).await?;

        sqlx::query("UPDATE outcomes SET community_avg = ?, community_count = ? WHERE id = ?")
            .bind(avg)
            .bind(count)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(previous)
    }

    async fn recent_outcomes(&self, limit: i64) -> StorageResult<Vec<OutcomeRecord>> {
        let rows: Vec<OutcomeRow> = sqlx::query_as(
            r#"
            SELECT * FROM outcomes
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn outcomes_since(&self, since: DateTime<Utc>) -> StorageResult<Vec<OutcomeRecord>> {
        let rows: Vec<OutcomeRow> = sqlx::query_as(
            r#"
            SELECT * FROM outcomes
            WHERE created_at >= ?
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .bind(ts(since))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    async fn insert_rule(&self, rule: &DiscoveredRule) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO discovered_rules (
                id, category, rule, confidence, sample_size, evidence,
                incorporated, incorporated_in, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.category)
        .bind(&rule.rule)
        .bind(rule.confidence)
        .bind(rule.sample_size)
        .bind(&rule.evidence)
        .bind(rule.incorporated)
        .bind(&rule.incorporated_in)
        .bind(ts(rule.created_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_rules(&self) -> StorageResult<Vec<DiscoveredRule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(
            "SELECT * FROM discovered_rules ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn pending_rules(
        &self,
        min_confidence: f64,
        limit: i64,
    ) -> StorageResult<Vec<DiscoveredRule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(
            r#"
            SELECT * FROM discovered_rules
            WHERE incorporated = 0 AND confidence >= ?
            ORDER BY confidence DESC, created_at ASC
            LIMIT ?
            "#,
        )
        .bind(min_confidence)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn mark_rules_incorporated(&self, ids: &[String], version: &str) -> StorageResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut marked = 0;

        for id in ids {
            let result = sqlx::query(
                r#"
                UPDATE discovered_rules
                SET incorporated = 1, incorporated_in = ?
                WHERE id = ? AND incorporated = 0
                "#,
            )
            .bind(version)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            marked += result.rows_affected();
        }

        tx.commit().await?;
        Ok(marked)
    }

    async fn mark_all_rules_incorporated(&self, version: &str) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE discovered_rules
            SET incorporated = 1, incorporated_in = ?
            WHERE incorporated = 0
            "#,
        )
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Cycles
    // ------------------------------------------------------------------

    async fn insert_cycle(&self, cycle: &ImprovementCycle) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO improvement_cycles (id, trigger_kind, status, started_at, log)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cycle.id)
        .bind(cycle.trigger.as_str())
        .bind(cycle.status.as_str())
        .bind(ts(cycle.started_at))
        .bind(cycle.log.join("\n"))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_cycle(&self, cycle: &ImprovementCycle) -> StorageResult<()> {
        let trigger_metrics = match &cycle.trigger_metrics {
            Some(v) => Some(to_json(v)?),
            None => None,
        };
        let knowledge = match &cycle.knowledge_extracted {
            Some(v) => Some(to_json(v)?),
            None => None,
        };

        let result = sqlx::query(
            r#"
            UPDATE improvement_cycles
            SET status = ?, completed_at = ?, source_version = ?, candidate_version = ?,
                trigger_metrics = ?, weaknesses_found = ?, knowledge_extracted = ?, log = ?
            WHERE id = ?
            "#,
        )
        .bind(cycle.status.as_str())
        .bind(cycle.completed_at.map(ts))
        .bind(&cycle.source_version)
        .bind(&cycle.candidate_version)
        .bind(trigger_metrics)
        .bind(to_json(&cycle.weaknesses_found)?)
        .bind(knowledge)
        .bind(cycle.log.join("\n"))
        .bind(&cycle.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "Cycle",
                id: cycle.id.clone(),
            });
        }

        Ok(())
    }

    async fn recent_cycles(&self, limit: i64) -> StorageResult<Vec<ImprovementCycle>> {
        let rows: Vec<CycleRow> = sqlx::query_as(
            r#"
            SELECT * FROM improvement_cycles
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn latest_completed_cycle(&self) -> StorageResult<Option<ImprovementCycle>> {
        let row: Option<CycleRow> = sqlx::query_as(
            r#"
            SELECT * FROM improvement_cycles
            WHERE status = 'completed'
            ORDER BY started_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    // ------------------------------------------------------------------
    // Calibration snapshots
    // ------------------------------------------------------------------

    async fn upsert_snapshot(&self, snapshot: &CalibrationSnapshot) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO calibration_snapshots (
                period, sample_size, avg_score, avg_community, delta, correlation, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(period) DO UPDATE SET
                sample_size = excluded.sample_size,
                avg_score = excluded.avg_score,
                avg_community = excluded.avg_community,
                delta = excluded.delta,
                correlation = excluded.correlation,
                created_at = excluded.created_at
            "#,
        )
        .bind(&snapshot.period)
        .bind(snapshot.sample_size)
        .bind(snapshot.avg_score)
        .bind(snapshot.avg_community)
        .bind(snapshot.delta)
        .bind(snapshot.correlation)
        .bind(ts(snapshot.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_snapshots(&self, limit: i64) -> StorageResult<Vec<CalibrationSnapshot>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT * FROM calibration_snapshots ORDER BY period DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    // ------------------------------------------------------------------
    // Auxiliary signals
    // ------------------------------------------------------------------

    async fn insert_follow_up(&self, question: &FollowUpQuestion) -> StorageResult<()> {
        sqlx::query("INSERT INTO follow_up_questions (id, question, created_at) VALUES (?, ?, ?)")
            .bind(&question.id)
            .bind(&question.question)
            .bind(ts(question.created_at))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn follow_ups_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> StorageResult<Vec<FollowUpQuestion>> {
        let rows: Vec<FollowUpRow> = sqlx::query_as(
            r#"
            SELECT id, question, created_at FROM follow_up_questions
            WHERE created_at >= ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(ts(since))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| FollowUpQuestion {
                id: r.id,
                question: r.question,
                created_at: parse_timestamp(&r.created_at),
            })
            .collect())
    }

    async fn insert_comparison(&self, post: &ComparisonPost) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO comparison_posts (id, categories, votes_a, votes_b, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(to_json(&post.categories)?)
        .bind(post.votes_a)
        .bind(post.votes_b)
        .bind(ts(post.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_comparisons(&self, limit: i64) -> StorageResult<Vec<ComparisonPost>> {
        let rows: Vec<ComparisonRow> = sqlx::query_as(
            r#"
            SELECT id, categories, votes_a, votes_b, created_at FROM comparison_posts
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ComparisonPost {
                id: r.id,
                categories: serde_json::from_str(&r.categories).unwrap_or_default(),
                votes_a: r.votes_a,
                votes_b: r.votes_b,
                created_at: parse_timestamp(&r.created_at),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Leases
    // ------------------------------------------------------------------

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let now = Utc::now();

        // The conflict branch only fires when the lease expired or is ours already.
        let result = sqlx::query(
            r#"
            INSERT INTO leases (name, holder, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE leases.expires_at <= ? OR leases.holder = excluded.holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(ts(now))
        .bind(ts(now + ttl))
        .bind(ts(now))
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!(lease = %name, holder = %holder, acquired, "Lease acquisition attempted");
        Ok(acquired)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM leases WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct VariantRow {
    version: String,
    parent_version: Option<String>,
    cohort: Option<String>,
    text: String,
    traffic_pct: i64,
    is_active: bool,
    is_candidate: bool,
    source: String,
    sample_size: i64,
    avg_score: Option<f64>,
    rating_count: i64,
    avg_user_rating: Option<f64>,
    helpful_count: i64,
    helpful_votes: i64,
    community_delta_count: i64,
    avg_community_delta: Option<f64>,
    source_rule_ids: String,
    promoted_at: Option<String>,
    created_at: String,
}

impl From<VariantRow> for Variant {
    fn from(row: VariantRow) -> Self {
        Self {
            version: row.version,
            parent_version: row.parent_version,
            cohort: row.cohort,
            text: row.text,
            traffic_pct: row.traffic_pct,
            is_active: row.is_active,
            is_candidate: row.is_candidate,
            source: row.source.parse().unwrap_or(VariantSource::Manual),
            sample_size: row.sample_size,
            avg_score: row.avg_score,
            rating_count: row.rating_count,
            avg_user_rating: row.avg_user_rating,
            helpful_count: row.helpful_count,
            helpful_votes: row.helpful_votes,
            community_delta_count: row.community_delta_count,
            avg_community_delta: row.avg_community_delta,
            source_rule_ids: serde_json::from_str(&row.source_rule_ids).unwrap_or_default(),
            promoted_at: row.promoted_at.as_deref().map(parse_timestamp),
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct OutcomeRow {
    id: String,
    variant_version: String,
    user_id: Option<String>,
    score: Option<f64>,
    user_rating: Option<i64>,
    helpful: Option<bool>,
    community_avg: Option<f64>,
    community_count: i64,
    categories: String,
    profile: Option<String>,
    is_fallback: bool,
    created_at: String,
}

impl From<OutcomeRow> for OutcomeRecord {
    fn from(row: OutcomeRow) -> Self {
        Self {
            id: row.id,
            variant_version: row.variant_version,
            user_id: row.user_id,
            score: row.score,
            user_rating: row.user_rating,
            helpful: row.helpful,
            community_avg: row.community_avg,
            community_count: row.community_count,
            categories: serde_json::from_str(&row.categories).unwrap_or_default(),
            profile: row.profile.and_then(|s| serde_json::from_str(&s).ok()),
            is_fallback: row.is_fallback,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: String,
    category: String,
    rule: String,
    confidence: f64,
    sample_size: i64,
    evidence: String,
    incorporated: bool,
    incorporated_in: Option<String>,
    created_at: String,
}

impl From<RuleRow> for DiscoveredRule {
    fn from(row: RuleRow) -> Self {
        Self {
            id: row.id,
            category: row.category,
            rule: row.rule,
            confidence: row.confidence,
            sample_size: row.sample_size,
            evidence: row.evidence,
            incorporated: row.incorporated,
            incorporated_in: row.incorporated_in,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct CycleRow {
    id: String,
    trigger_kind: String,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    source_version: Option<String>,
    candidate_version: Option<String>,
    trigger_metrics: Option<String>,
    weaknesses_found: String,
    knowledge_extracted: Option<String>,
    log: String,
}

impl From<CycleRow> for ImprovementCycle {
    fn from(row: CycleRow) -> Self {
        Self {
            id: row.id,
            trigger: row.trigger_kind.parse().unwrap_or(CycleTrigger::Manual),
            status: row.status.parse().unwrap_or(CycleStatus::Failed),
            started_at: parse_timestamp(&row.started_at),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
            source_version: row.source_version,
            candidate_version: row.candidate_version,
            trigger_metrics: row.trigger_metrics.and_then(|s| serde_json::from_str(&s).ok()),
            weaknesses_found: serde_json::from_str(&row.weaknesses_found).unwrap_or_default(),
            knowledge_extracted: row
                .knowledge_extracted
                .and_then(|s| serde_json::from_str(&s).ok()),
            log: if row.log.is_empty() {
                Vec::new()
            } else {
                row.log.lines().map(String::from).collect()
            },
        }
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    period: String,
    sample_size: i64,
    avg_score: f64,
    avg_community: f64,
    delta: f64,
    correlation: Option<f64>,
    created_at: String,
}

impl From<SnapshotRow> for CalibrationSnapshot {
    fn from(row: SnapshotRow) -> Self {
        Self {
            period: row.period,
            sample_size: row.sample_size,
            avg_score: row.avg_score,
            avg_community: row.avg_community,
            delta: row.delta,
            correlation: row.correlation,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct FollowUpRow {
    id: String,
    question: String,
    created_at: String,
}

#[derive(sqlx::FromRow)]
struct ComparisonRow {
    id: String,
    categories: String,
    votes_a: i64,
    votes_b: i64,
    created_at: String,
}
