/*!
Database Layer

Runtime-bound queries over the relational tables the pipeline owns:
`job_batches`, `tracking_results`, `prompts`, plus the externally-owned
`projects`, `tags`, `prompt_tags` and `user_settings` tables whose
columns the core reads.
*/

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    now_millis, BatchStatus, JobBatch, Project, Prompt, ResultStatus, TrackingResult,
    TrackingUpdate,
};

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

/// Counter snapshot for one job batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCounters {
    pub completed: i32,
    pub failed: i32,
    pub total: i32,
}

impl BatchCounters {
    pub fn is_complete(&self) -> bool {
        self.completed + self.failed >= self.total
    }
}

/// Everything needed to create one submission transactionally.
pub struct NewSubmission {
    pub user_id: String,
    pub project_id: String,
    pub email: Option<String>,
    pub openai_key: String,
    pub openai_model: String,
    pub web_search: bool,
    pub geo: Option<String>,
    pub brand_mentions: Vec<String>,
    pub domain_mentions: Vec<String>,
    pub tags: Vec<String>,
    pub prompts: Vec<String>,
    pub total_batches: i32,
    pub shard_size: usize,
}

/// Ids created by a submission, aligned index-for-index with the input
/// prompt list.
pub struct CreatedSubmission {
    pub job_batch_id: Uuid,
    pub prompt_ids: Vec<Uuid>,
    pub tracking_ids: Vec<Uuid>,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    // -------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------

    /// Insert the job batch, its prompt rows and its pending tracking
    /// rows as one transaction. Nothing persists if any insert fails.
    pub async fn create_submission(&self, sub: &NewSubmission) -> Result<CreatedSubmission> {
        let mut tx = self.pool.begin().await?;

        let job_batch_id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO job_batches (
                id, user_id, project_id, email, total_prompts, total_batches,
                completed_batches, failed_batches, status, openai_key, openai_model,
                web_search, geo, brand_mentions, domain_mentions, tags, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 0, 0, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(job_batch_id)
        .bind(&sub.user_id)
        .bind(&sub.project_id)
        .bind(&sub.email)
        .bind(sub.prompts.len() as i32)
        .bind(sub.total_batches)
        .bind(BatchStatus::Pending)
        .bind(&sub.openai_key)
        .bind(&sub.openai_model)
        .bind(sub.web_search)
        .bind(&sub.geo)
        .bind(Json(&sub.brand_mentions))
        .bind(Json(&sub.domain_mentions))
        .bind(Json(&sub.tags))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut prompt_ids = Vec::with_capacity(sub.prompts.len());
        let mut tracking_ids = Vec::with_capacity(sub.prompts.len());

        for (i, text) in sub.prompts.iter().enumerate() {
            let prompt_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO prompts (
                    id, project_id, user_id, text, enabled,
                    brand_mentions, domain_mentions, geo, created_at
                ) VALUES ($1, $2, $3, $4, TRUE, $5, $6, $7, $8)",
            )
            .bind(prompt_id)
            .bind(&sub.project_id)
            .bind(&sub.user_id)
            .bind(text)
            .bind(Json(&sub.brand_mentions))
            .bind(Json(&sub.domain_mentions))
            .bind(&sub.geo)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let tracking_id = Uuid::new_v4();
            let batch_number = (i / sub.shard_size) as i32;
            sqlx::query(
                "INSERT INTO tracking_results (
                    id, prompt_id, prompt_text, project_id, user_id,
                    job_batch_id, batch_number, status, timestamp
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(tracking_id)
            .bind(prompt_id)
            .bind(text)
            .bind(&sub.project_id)
            .bind(&sub.user_id)
            .bind(job_batch_id)
            .bind(batch_number)
            .bind(ResultStatus::Pending)
            .bind(now_millis())
            .execute(&mut *tx)
            .await?;

            prompt_ids.push(prompt_id);
            tracking_ids.push(tracking_id);
        }

        tx.commit().await?;

        Ok(CreatedSubmission {
            job_batch_id,
            prompt_ids,
            tracking_ids,
        })
    }

    // -------------------------------------------------------------------
    // Job batch state
    // -------------------------------------------------------------------

    pub async fn get_job_batch(&self, id: Uuid) -> Result<Option<JobBatch>> {
        let batch = sqlx::query_as::<_, JobBatch>(
            "SELECT id, user_id, project_id, email, total_prompts, total_batches,
                    completed_batches, failed_batches, status, openai_model, web_search,
                    geo, brand_mentions, domain_mentions, tags, error_message,
                    created_at, completed_at
             FROM job_batches WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(batch)
    }

    /// OpenAI credentials snapshotted on the batch, for callback-time
    /// enrichment.
    pub async fn get_batch_credentials(&self, id: Uuid) -> Result<Option<(String, String)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT openai_key, openai_model FROM job_batches WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn set_batch_status(&self, id: Uuid, status: BatchStatus) -> Result<()> {
        sqlx::query("UPDATE job_batches SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn batch_counters(&self, id: Uuid) -> Result<BatchCounters> {
        let (completed, failed, total) = sqlx::query_as::<_, (i32, i32, i32)>(
            "SELECT completed_batches, failed_batches, total_batches
             FROM job_batches WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(BatchCounters {
            completed,
            failed,
            total,
        })
    }

    /// Atomic increment; returns the post-increment counters.
    pub async fn increment_completed(&self, id: Uuid) -> Result<BatchCounters> {
        let (completed, failed, total) = sqlx::query_as::<_, (i32, i32, i32)>(
            "UPDATE job_batches SET completed_batches = completed_batches + 1
             WHERE id = $1
             RETURNING completed_batches, failed_batches, total_batches",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(BatchCounters {
            completed,
            failed,
            total,
        })
    }

    /// Atomic increment; returns the post-increment counters.
    pub async fn increment_failed(&self, id: Uuid) -> Result<BatchCounters> {
        let (completed, failed, total) = sqlx::query_as::<_, (i32, i32, i32)>(
            "UPDATE job_batches SET failed_batches = failed_batches + 1
             WHERE id = $1
             RETURNING completed_batches, failed_batches, total_batches",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(BatchCounters {
            completed,
            failed,
            total,
        })
    }

    /// Terminal transition: stamp status and `completed_at` together.
    pub async fn finalize_batch(
        &self,
        id: Uuid,
        status: BatchStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE job_batches SET status = $1, completed_at = $2, error_message = $3
             WHERE id = $4",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Tracking results
    // -------------------------------------------------------------------

    const RESULT_COLUMNS: &'static str =
        "id, prompt_id, prompt_text, project_id, user_id, job_batch_id, batch_number,
         external_task_id, status, is_present, is_domain_present, sentiment, salience,
         response, citations, mention_count, domain_mention_count, web_search, lcp,
         actionability, intent_classification, serp, ai_search_volume, ai_monthly_trends,
         ai_volume_fetched_at, ai_volume_location_code, timestamp, source";

    pub async fn get_result(&self, id: Uuid) -> Result<Option<TrackingResult>> {
        let sql = format!(
            "SELECT {} FROM tracking_results WHERE id = $1",
            Self::RESULT_COLUMNS
        );
        let row = sqlx::query_as::<_, TrackingResult>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_result_by_task_id(&self, task_id: &str) -> Result<Option<TrackingResult>> {
        let sql = format!(
            "SELECT {} FROM tracking_results WHERE external_task_id = $1",
            Self::RESULT_COLUMNS
        );
        let row = sqlx::query_as::<_, TrackingResult>(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Stamp the provider task id and move the row to `processing`.
    pub async fn stamp_task_id(&self, tracking_id: Uuid, task_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tracking_results
             SET external_task_id = $1, status = $2, timestamp = $3
             WHERE id = $4",
        )
        .bind(task_id)
        .bind(ResultStatus::Processing)
        .bind(now_millis())
        .bind(tracking_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply a full enrichment update and move the row to `fulfilled`.
    pub async fn fulfill_result(&self, id: Uuid, update: &TrackingUpdate) -> Result<()> {
        sqlx::query(
            "UPDATE tracking_results SET
                status = $1, response = $2, citations = $3, is_present = $4,
                is_domain_present = $5, mention_count = $6, domain_mention_count = $7,
                sentiment = $8, salience = $9, lcp = $10, actionability = $11,
                intent_classification = $12, serp = $13, web_search = $14,
                ai_search_volume = $15, ai_monthly_trends = $16,
                ai_volume_fetched_at = $17, ai_volume_location_code = $18,
                source = $19, timestamp = $20
             WHERE id = $21",
        )
        .bind(ResultStatus::Fulfilled)
        .bind(Json(&update.response))
        .bind(Json(&update.citations))
        .bind(update.is_present)
        .bind(update.is_domain_present)
        .bind(update.mention_count)
        .bind(update.domain_mention_count)
        .bind(update.sentiment)
        .bind(update.salience)
        .bind(update.lcp)
        .bind(update.actionability)
        .bind(&update.intent_classification)
        .bind(Json(&update.serp))
        .bind(update.web_search)
        .bind(update.volume.as_ref().map(|v| v.data.current_volume))
        .bind(update.volume.as_ref().map(|v| Json(&v.data.monthly_trends)))
        .bind(update.volume.as_ref().map(|v| v.fetched_at))
        .bind(update.volume.as_ref().map(|v| v.location_code))
        .bind(&update.source)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a fresh fulfilled row (nightly path: no pending stub).
    pub async fn insert_nightly_result(
        &self,
        prompt: &Prompt,
        update: &TrackingUpdate,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO tracking_results (
                id, prompt_id, prompt_text, project_id, user_id, job_batch_id,
                batch_number, status, response, citations, is_present,
                is_domain_present, mention_count, domain_mention_count, sentiment,
                salience, lcp, actionability, intent_classification, serp, web_search,
                ai_search_volume, ai_monthly_trends, ai_volume_fetched_at,
                ai_volume_location_code, source, timestamp
            ) VALUES ($1, $2, $3, $4, $5, NULL, 0, $6, $7, $8, $9, $10, $11, $12,
                      $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)",
        )
        .bind(id)
        .bind(prompt.id)
        .bind(&prompt.text)
        .bind(&prompt.project_id)
        .bind(&prompt.user_id)
        .bind(ResultStatus::Fulfilled)
        .bind(Json(&update.response))
        .bind(Json(&update.citations))
        .bind(update.is_present)
        .bind(update.is_domain_present)
        .bind(update.mention_count)
        .bind(update.domain_mention_count)
        .bind(update.sentiment)
        .bind(update.salience)
        .bind(update.lcp)
        .bind(update.actionability)
        .bind(&update.intent_classification)
        .bind(Json(&update.serp))
        .bind(update.web_search)
        .bind(update.volume.as_ref().map(|v| v.data.current_volume))
        .bind(update.volume.as_ref().map(|v| Json(&v.data.monthly_trends)))
        .bind(update.volume.as_ref().map(|v| v.fetched_at))
        .bind(update.volume.as_ref().map(|v| v.location_code))
        .bind(&update.source)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Mark one row failed. The `status != 'fulfilled'` guard makes late
    /// failure callbacks no-ops.
    pub async fn mark_result_failed(&self, id: Uuid, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tracking_results
             SET status = $1, response = $2, timestamp = $3
             WHERE id = $4 AND status <> $5",
        )
        .bind(ResultStatus::Failed)
        .bind(Json(serde_json::json!({ "error": reason })))
        .bind(now_millis())
        .bind(id)
        .bind(ResultStatus::Fulfilled)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fail every non-fulfilled row of a shard (empty snapshots, fatal
    /// upstream errors).
    pub async fn mark_shard_failed(
        &self,
        job_batch_id: Uuid,
        batch_number: i32,
        reason: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tracking_results
             SET status = $1, response = $2, timestamp = $3
             WHERE job_batch_id = $4 AND batch_number = $5 AND status <> $6",
        )
        .bind(ResultStatus::Failed)
        .bind(Json(serde_json::json!({ "error": reason })))
        .bind(now_millis())
        .bind(job_batch_id)
        .bind(batch_number)
        .bind(ResultStatus::Fulfilled)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_in_shard(&self, job_batch_id: Uuid, batch_number: i32) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tracking_results
             WHERE job_batch_id = $1 AND batch_number = $2",
        )
        .bind(job_batch_id)
        .bind(batch_number)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn count_unfinished_in_shard(
        &self,
        job_batch_id: Uuid,
        batch_number: i32,
    ) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tracking_results
             WHERE job_batch_id = $1 AND batch_number = $2 AND status IN ($3, $4)",
        )
        .bind(job_batch_id)
        .bind(batch_number)
        .bind(ResultStatus::Pending)
        .bind(ResultStatus::Processing)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn any_fulfilled_in_shard(
        &self,
        job_batch_id: Uuid,
        batch_number: i32,
    ) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tracking_results
             WHERE job_batch_id = $1 AND batch_number = $2 AND status = $3",
        )
        .bind(job_batch_id)
        .bind(batch_number)
        .bind(ResultStatus::Fulfilled)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    // -------------------------------------------------------------------
    // Tags
    // -------------------------------------------------------------------

    /// Case-insensitive upsert of tag names within a project. Returns
    /// tag ids aligned with the input order.
    pub async fn upsert_tags(&self, project_id: &str, names: &[String]) -> Result<Vec<Uuid>> {
        const DEFAULT_COLOR: &str = "#6B7280";

        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let existing: Option<(Uuid,)> = sqlx::query_as(
                "SELECT id FROM tags WHERE project_id = $1 AND LOWER(name) = LOWER($2)",
            )
            .bind(project_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

            let id = match existing {
                Some((id,)) => id,
                None => {
                    let id = Uuid::new_v4();
                    sqlx::query(
                        "INSERT INTO tags (id, project_id, name, color, created_at)
                         VALUES ($1, $2, $3, $4, $5)",
                    )
                    .bind(id)
                    .bind(project_id)
                    .bind(name)
                    .bind(DEFAULT_COLOR)
                    .bind(Utc::now())
                    .execute(&self.pool)
                    .await?;
                    id
                }
            };
            ids.push(id);
        }
        Ok(ids)
    }

    pub async fn attach_tags(&self, prompt_ids: &[Uuid], tag_ids: &[Uuid]) -> Result<()> {
        for prompt_id in prompt_ids {
            for tag_id in tag_ids {
                sqlx::query(
                    "INSERT INTO prompt_tags (prompt_id, tag_id)
                     VALUES ($1, $2) ON CONFLICT DO NOTHING",
                )
                .bind(prompt_id)
                .bind(tag_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Nightly scheduler support
    // -------------------------------------------------------------------

    /// All projects with a configured cadence.
    pub async fn projects_with_cadence(&self) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>(
            "SELECT id, user_id, name, scheduler_frequency, last_nightly_run_at
             FROM projects WHERE scheduler_frequency IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(projects)
    }

    pub async fn enabled_prompts(&self, project_id: &str) -> Result<Vec<Prompt>> {
        let prompts = sqlx::query_as::<_, Prompt>(
            "SELECT id, project_id, user_id, text, enabled, brand_mentions,
                    domain_mentions, geo, created_at
             FROM prompts WHERE project_id = $1 AND enabled = TRUE
             ORDER BY created_at",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(prompts)
    }

    pub async fn get_prompt(&self, id: Uuid) -> Result<Option<Prompt>> {
        let prompt = sqlx::query_as::<_, Prompt>(
            "SELECT id, project_id, user_id, text, enabled, brand_mentions,
                    domain_mentions, geo, created_at
             FROM prompts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(prompt)
    }

    pub async fn stamp_nightly_run(&self, project_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE projects SET last_nightly_run_at = $1 WHERE id = $2")
            .bind(at)
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_openai_key(&self, user_id: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT openai_key FROM user_settings WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(key,)| key))
    }

    /// Last-ditch status write used when the full enrichment UPDATE
    /// fails mid-finalization.
    pub async fn force_fail_result(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE tracking_results SET status = $1, timestamp = $2
             WHERE id = $3 AND status <> $4",
        )
        .bind(ResultStatus::Failed)
        .bind(now_millis())
        .bind(id)
        .bind(ResultStatus::Fulfilled)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::DbUpdateFailed(e.to_string()))?;
        Ok(())
    }
}
