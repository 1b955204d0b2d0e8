/*!
Callback dispatcher (DataForSEO).

Shard dispatch submits one task per prompt with a postback URL; results
arrive later on the webhook. Nightly callbacks INSERT fresh rows; API
callbacks UPDATE the stub the submission created. A failure callback
arriving after a row is fulfilled is ignored.
*/

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::batch::{self, ShardOutcome};
use crate::database::Database;
use crate::dataforseo::{
    normalize_task, postback_url, submission_spacer, CallbackBody, CallbackContext,
    CallbackTask, DataForSeoClient,
};
use crate::enrich;
use crate::error::{Error, Result};
use crate::model::{ProviderKind, ShardJob, TrackingResult, VolumeStamp};
use crate::notifier::{NotificationKind, Notifier};
use crate::openai::OpenAiClient;
use crate::retry::with_backoff;
use crate::volume::VolumeClient;

use super::{location_code_for, shard_context, Dispatcher};

pub struct CallbackDispatcher {
    db: Database,
    notifier: Notifier,
    client: DataForSeoClient,
    app_url: String,
}

impl CallbackDispatcher {
    pub fn new(
        db: Database,
        notifier: Notifier,
        client: DataForSeoClient,
        app_url: String,
    ) -> Self {
        Self {
            db,
            notifier,
            client,
            app_url,
        }
    }
}

#[async_trait]
impl Dispatcher for CallbackDispatcher {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Dataforseo
    }

    /// Submit one task per prompt. The tracking rows move to
    /// `processing`; fulfillment happens when the callbacks land.
    async fn dispatch_shard(&self, job: &ShardJob) -> Result<()> {
        for (i, prompt) in job.prompts.iter().enumerate() {
            if i > 0 {
                submission_spacer().await;
            }

            let ctx = CallbackContext {
                user_id: job.user_id.clone(),
                openai_model: Some(job.openai_model.clone()),
                is_nightly: job.nightly,
                prompt_id: Some(prompt.prompt_id),
                project_id: Some(job.project_id.clone()),
            };
            let postback = postback_url(&self.app_url, &ctx);

            let geo = prompt.geo.as_deref().or(job.geo.as_deref());
            let task_id = with_backoff("task_post", || {
                self.client
                    .submit_task(&prompt.text, job.web_search, geo, &postback)
            })
            .await?;

            // For nightly shards there is no stub; the stamped task id
            // on the row is the only correlation token.
            if let Some(tracking_id) = prompt.tracking_id {
                self.db.stamp_task_id(tracking_id, &task_id).await?;
            }
        }

        if let Some(ctx) = shard_context(job) {
            self.db
                .set_batch_status(ctx.job_batch_id, crate::model::BatchStatus::Processing)
                .await?;

            if let Some(email) = ctx.email.as_deref() {
                let vars = json!({
                    "job_batch_id": ctx.job_batch_id.to_string(),
                    "batch_number": ctx.batch_number + 1,
                    "total_batches": ctx.total_batches,
                    "prompt_count": ctx.prompt_count,
                });
                if let Err(e) = self
                    .notifier
                    .send(NotificationKind::Submitted, email, vars)
                    .await
                {
                    warn!(error = %e, "submitted notification failed");
                }
            }
        }

        info!(
            batch_number = job.batch_number,
            prompts = job.prompts.len(),
            "shard tasks submitted"
        );
        Ok(())
    }
}

/// Webhook-side handler, shared with the HTTP layer.
#[derive(Clone)]
pub struct CallbackHandler {
    db: Database,
    notifier: Notifier,
    volume: Option<VolumeClient>,
}

impl CallbackHandler {
    pub fn new(db: Database, notifier: Notifier, volume: Option<VolumeClient>) -> Self {
        Self {
            db,
            notifier,
            volume,
        }
    }

    /// Process one provider callback. Logical failures are recorded and
    /// still return Ok so the provider gets its 200.
    pub async fn handle(&self, ctx: &CallbackContext, body: &CallbackBody) -> Result<()> {
        let Some(task) = body.task() else {
            return Err(Error::InvalidRequest("callback carried no tasks".to_string()));
        };

        info!(
            task_id = %task.id,
            status_code = task.status_code,
            nightly = ctx.is_nightly,
            "provider callback received"
        );

        if ctx.is_nightly {
            self.handle_nightly(ctx, task).await
        } else {
            self.handle_tracked(ctx, task).await
        }
    }

    async fn handle_tracked(&self, ctx: &CallbackContext, task: &CallbackTask) -> Result<()> {
        let Some(row) = self.db.get_result_by_task_id(&task.id).await? else {
            warn!(task_id = %task.id, "callback for unknown task, ignoring");
            return Ok(());
        };

        if task.succeeded() && task.first_result().is_some() {
            self.fulfill_tracked(ctx, task, &row).await?;
        } else {
            // Late-failure guard: the UPDATE skips fulfilled rows.
            let downgraded = self
                .db
                .mark_result_failed(
                    row.id,
                    &format!("upstream_failed:{}", task.status_message),
                )
                .await?;
            if !downgraded {
                info!(task_id = %task.id, "late failure after fulfillment, ignored");
                return Ok(());
            }
        }

        self.maybe_finalize_shard(&row).await
    }

    async fn fulfill_tracked(
        &self,
        ctx: &CallbackContext,
        task: &CallbackTask,
        row: &TrackingResult,
    ) -> Result<()> {
        let Some(job_batch_id) = row.job_batch_id else {
            return Err(Error::Internal(format!(
                "tracked result {} has no job batch",
                row.id
            )));
        };

        let Some(batch) = self.db.get_job_batch(job_batch_id).await? else {
            return Err(Error::NotFound(format!("job batch {job_batch_id}")));
        };
        let Some((openai_key, openai_model)) =
            self.db.get_batch_credentials(job_batch_id).await?
        else {
            return Err(Error::NotFound(format!(
                "credentials for job batch {job_batch_id}"
            )));
        };
        let model = ctx
            .openai_model
            .clone()
            .unwrap_or(openai_model);

        let normalized = normalize_task(task);
        let llm = OpenAiClient::new(&openai_key);
        let enrichment = enrich::enrich(
            &llm,
            &model,
            &normalized,
            &batch.brand_mentions.0,
            &batch.domain_mentions.0,
        )
        .await;

        let volume = self
            .single_volume(&row.prompt_text, batch.geo.as_deref())
            .await;
        let source = ProviderKind::Dataforseo.source(false);
        let update = enrichment.into_update(normalized.raw.clone(), source, volume);

        if let Err(e) = self.db.fulfill_result(row.id, &update).await {
            warn!(error = %e, tracking_id = %row.id, "fulfillment update failed, forcing failed");
            self.db.force_fail_result(row.id).await?;
            return Err(Error::DbUpdateFailed(e.to_string()));
        }
        Ok(())
    }

    async fn handle_nightly(&self, ctx: &CallbackContext, task: &CallbackTask) -> Result<()> {
        // Failed nightly scrapes leave no row behind.
        if !task.succeeded() || task.first_result().is_none() {
            info!(task_id = %task.id, "nightly callback reported failure, no row created");
            return Ok(());
        }

        let Some(prompt_id) = ctx.prompt_id else {
            return Err(Error::InvalidRequest(
                "nightly callback missing promptId".to_string(),
            ));
        };
        let Some(prompt) = self.db.get_prompt(prompt_id).await? else {
            warn!(%prompt_id, "nightly prompt vanished, dropping callback");
            return Ok(());
        };

        let Some(openai_key) = self.db.get_openai_key(&prompt.user_id).await? else {
            warn!(user_id = %prompt.user_id, "no OpenAI key for nightly user, dropping");
            return Ok(());
        };
        let model = ctx
            .openai_model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".to_string());

        let normalized = normalize_task(task);
        let llm = OpenAiClient::new(&openai_key);
        let enrichment = enrich::enrich(
            &llm,
            &model,
            &normalized,
            &prompt.brand_mentions.0,
            &prompt.domain_mentions.0,
        )
        .await;

        let volume = self.single_volume(&prompt.text, prompt.geo.as_deref()).await;
        let source = ProviderKind::Dataforseo.source(true);
        let update = enrichment.into_update(normalized.raw.clone(), source, volume);

        let id = self.db.insert_nightly_result(&prompt, &update).await?;
        info!(tracking_id = %id, "nightly result inserted");
        Ok(())
    }

    async fn single_volume(&self, prompt: &str, geo: Option<&str>) -> Option<VolumeStamp> {
        let client = self.volume.as_ref()?;
        let location_code = location_code_for(geo);
        match client.batch_volumes(&[prompt.to_string()], location_code).await {
            Ok(mut aligned) => aligned.pop().flatten().map(|data| VolumeStamp {
                data,
                location_code,
                fetched_at: chrono::Utc::now(),
            }),
            Err(e) => {
                warn!(error = %e, "volume lookup failed for callback");
                None
            }
        }
    }

    /// When the last row of the shard reaches a terminal status, record
    /// the shard on the batch. The counter sum-guard makes concurrent
    /// callbacks and provider retries safe.
    async fn maybe_finalize_shard(&self, row: &TrackingResult) -> Result<()> {
        let Some(job_batch_id) = row.job_batch_id else {
            return Ok(());
        };

        let unfinished = self
            .db
            .count_unfinished_in_shard(job_batch_id, row.batch_number)
            .await?;
        if unfinished > 0 {
            return Ok(());
        }

        let Some(batch) = self.db.get_job_batch(job_batch_id).await? else {
            return Ok(());
        };

        let any_fulfilled = self
            .db
            .any_fulfilled_in_shard(job_batch_id, row.batch_number)
            .await?;
        let outcome = if any_fulfilled {
            ShardOutcome::Completed
        } else {
            ShardOutcome::Failed
        };

        let prompt_count = self
            .db
            .count_in_shard(job_batch_id, row.batch_number)
            .await? as usize;

        let ctx = batch::ShardContext {
            job_batch_id,
            batch_number: row.batch_number,
            total_batches: batch.total_batches,
            prompt_count,
            email: batch.email.clone(),
        };
        batch::finalize_shard(
            &self.db,
            &self.notifier,
            &ctx,
            outcome,
            (!any_fulfilled).then_some("all prompts in shard failed"),
        )
        .await
    }
}
