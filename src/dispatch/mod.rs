/*!
Dispatcher workers.

One worker per scraping provider, each draining its own queue topic.
The polling worker (Bright Data) and the callback worker (DataForSEO)
share the message preamble, the retry/acknowledgement policy and the
shard failure path defined here.
*/

pub mod callback;
pub mod polling;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::batch::{self, ShardContext, ShardOutcome};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::model::{ProviderKind, ShardJob, VolumeStamp};
use crate::notifier::Notifier;
use crate::queue::{run_consumer, Delivery, Disposition, Queue};
use crate::volume::VolumeClient;
use tokio_util::sync::CancellationToken;

/// DataForSEO location code for the United States, the fallback when a
/// geo hint is missing or unknown.
pub const DEFAULT_LOCATION_CODE: i32 = 2840;

/// Map a free-form geo hint to a volume-API location code.
pub fn location_code_for(geo: Option<&str>) -> i32 {
    match geo.map(|g| g.trim().to_lowercase()).as_deref() {
        Some("united states") | Some("us") | Some("usa") => 2840,
        Some("united kingdom") | Some("uk") | Some("gb") => 2826,
        Some("canada") | Some("ca") => 2124,
        Some("australia") | Some("au") => 2036,
        Some("germany") | Some("de") => 2276,
        Some("france") | Some("fr") => 2250,
        _ => DEFAULT_LOCATION_CODE,
    }
}

/// A provider-specific dispatcher: consumes whole shards, and (for the
/// callback variant) provider signals arriving out of band.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Process one shard end to end.
    async fn dispatch_shard(&self, job: &ShardJob) -> Result<()>;
}

/// The shard context used for batch-state updates, when the shard
/// belongs to an API submission. Nightly shards return None.
pub fn shard_context(job: &ShardJob) -> Option<ShardContext> {
    job.job_batch_id.map(|job_batch_id| ShardContext {
        job_batch_id,
        batch_number: job.batch_number,
        total_batches: job.total_batches,
        prompt_count: job.prompts.len(),
        email: job.email.clone(),
    })
}

/// Fail every result of the shard with `err`'s reason, then record the
/// shard failure on the batch.
pub async fn fail_shard(db: &Database, notifier: &Notifier, job: &ShardJob, err: &Error) {
    warn!(
        service = %job.service,
        batch_number = job.batch_number,
        error = %err,
        "failing shard"
    );

    let Some(ctx) = shard_context(job) else {
        return;
    };

    if let Err(e) = db
        .mark_shard_failed(ctx.job_batch_id, ctx.batch_number, err.reason())
        .await
    {
        error!(error = %e, "failed to mark shard results failed");
    }

    if let Err(e) = batch::finalize_shard(
        db,
        notifier,
        &ctx,
        ShardOutcome::Failed,
        Some(&err.to_string()),
    )
    .await
    {
        error!(error = %e, "failed to finalize failed shard");
    }
}

/// Fetch per-prompt volume data for a shard. A failed lookup degrades
/// to nulls; it never fails the shard.
pub async fn fetch_volumes(
    volume: Option<&VolumeClient>,
    job: &ShardJob,
) -> Vec<Option<VolumeStamp>> {
    let Some(client) = volume else {
        return vec![None; job.prompts.len()];
    };

    let prompts: Vec<String> = job.prompts.iter().map(|p| p.text.clone()).collect();
    let location_code = location_code_for(job.geo.as_deref());

    match client.batch_volumes(&prompts, location_code).await {
        Ok(aligned) => {
            let fetched_at = Utc::now();
            aligned
                .into_iter()
                .map(|data| {
                    data.map(|data| VolumeStamp {
                        data,
                        location_code,
                        fetched_at,
                    })
                })
                .collect()
        }
        Err(e) => {
            warn!(error = %e, "volume lookup failed for shard");
            vec![None; job.prompts.len()]
        }
    }
}

/// Wire a dispatcher to its topic and drain until cancelled.
pub async fn run_dispatcher<D: Dispatcher + 'static>(
    queue: Queue,
    db: Database,
    notifier: Notifier,
    dispatcher: std::sync::Arc<D>,
    shutdown: CancellationToken,
) {
    let topic = dispatcher.provider().topic();
    let subscription = queue.subscribe(topic).await;

    run_consumer(queue.clone(), subscription, shutdown, move |delivery| {
        let dispatcher = dispatcher.clone();
        let db = db.clone();
        let notifier = notifier.clone();
        async move { handle_delivery(&*dispatcher, &db, &notifier, delivery).await }
    })
    .await;
}

/// The common preamble plus the retry/acknowledgement policy: payloads
/// for the wrong service are dropped, retryable upstream errors nack,
/// anything else force-fails the shard and acks.
pub async fn handle_delivery<D: Dispatcher + ?Sized>(
    dispatcher: &D,
    db: &Database,
    notifier: &Notifier,
    delivery: Delivery,
) -> Disposition {
    let job = match delivery.shard_job() {
        Ok(job) => job,
        Err(e) => {
            error!(error = %e, "unparseable queue payload, dropping");
            return Disposition::Ack;
        }
    };

    if job.service != dispatcher.provider() {
        warn!(
            expected = %dispatcher.provider(),
            got = %job.service,
            "payload for another service, dropping"
        );
        return Disposition::Ack;
    }

    info!(
        service = %job.service,
        job_batch_id = ?job.job_batch_id,
        batch_number = job.batch_number,
        prompts = job.prompts.len(),
        nightly = job.nightly,
        attempt = delivery.attempt,
        "processing shard"
    );

    match dispatcher.dispatch_shard(&job).await {
        Ok(()) => Disposition::Ack,
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "retryable shard failure, nacking");
            Disposition::Nack
        }
        Err(e) => {
            fail_shard(db, notifier, &job, &e).await;
            Disposition::Ack
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn location_codes_cover_known_geos() {
        assert_eq!(location_code_for(Some("United States")), 2840);
        assert_eq!(location_code_for(Some("uk")), 2826);
        assert_eq!(location_code_for(Some("Atlantis")), DEFAULT_LOCATION_CODE);
        assert_eq!(location_code_for(None), DEFAULT_LOCATION_CODE);
    }

    #[test]
    fn nightly_jobs_have_no_shard_context() {
        let job = ShardJob {
            service: ProviderKind::Brightdata,
            nightly: true,
            external_task_id: None,
            user_id: "u".to_string(),
            project_id: "p".to_string(),
            email: None,
            job_batch_id: None,
            batch_number: 0,
            total_batches: 1,
            openai_key: "sk".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            web_search: false,
            geo: None,
            prompts: Vec::new(),
        };
        assert!(shard_context(&job).is_none());

        let with_batch = ShardJob {
            nightly: false,
            job_batch_id: Some(Uuid::new_v4()),
            ..job
        };
        let ctx = shard_context(&with_batch).unwrap();
        assert_eq!(ctx.batch_number, 0);
    }
}
