/*!
Polling dispatcher (Bright Data).

One dataset trigger covers the shard; the snapshot is polled until the
provider serves the result array. Results are matched back to their
prompts by text, enriched sequentially, and written in place.
*/

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::batch::{self, ShardOutcome};
use crate::brightdata::{
    entry_matches_prompt, normalize_entry, BrightdataClient, ScrapeInput, SnapshotEntry,
};
use crate::database::Database;
use crate::enrich;
use crate::error::{Error, Result};
use crate::model::{PromptJob, ProviderKind, ShardJob, VolumeStamp};
use crate::notifier::Notifier;
use crate::openai::OpenAiClient;
use crate::retry::with_backoff;
use crate::volume::VolumeClient;

use super::{fetch_volumes, shard_context, Dispatcher};

/// Target URL submitted with every scrape input.
const CHAT_URL: &str = "https://chatgpt.com";

pub struct PollingDispatcher {
    db: Database,
    notifier: Notifier,
    client: BrightdataClient,
    volume: Option<VolumeClient>,
}

impl PollingDispatcher {
    pub fn new(
        db: Database,
        notifier: Notifier,
        client: BrightdataClient,
        volume: Option<VolumeClient>,
    ) -> Self {
        Self {
            db,
            notifier,
            client,
            volume,
        }
    }

    async fn process_result(
        &self,
        job: &ShardJob,
        prompt: &PromptJob,
        entry: &SnapshotEntry,
        llm: &OpenAiClient,
        volume: Option<VolumeStamp>,
    ) -> Result<()> {
        let normalized = normalize_entry(entry, job.web_search);
        let enrichment = enrich::enrich(
            llm,
            &job.openai_model,
            &normalized,
            &prompt.brand_mentions,
            &prompt.domain_mentions,
        )
        .await;

        let source = job.service.source(job.nightly);
        let update = enrichment.into_update(normalized.raw.clone(), source, volume);

        if job.nightly {
            let Some(row) = self.db.get_prompt(prompt.prompt_id).await? else {
                warn!(prompt_id = %prompt.prompt_id, "nightly prompt vanished, skipping insert");
                return Ok(());
            };
            self.db.insert_nightly_result(&row, &update).await?;
        } else if let Some(tracking_id) = prompt.tracking_id {
            if let Err(e) = self.db.fulfill_result(tracking_id, &update).await {
                error!(error = %e, %tracking_id, "enrichment update failed, forcing failed status");
                self.db.force_fail_result(tracking_id).await?;
                return Err(Error::DbUpdateFailed(e.to_string()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for PollingDispatcher {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Brightdata
    }

    async fn dispatch_shard(&self, job: &ShardJob) -> Result<()> {
        let llm = OpenAiClient::new(&job.openai_key);

        // A payload carrying a snapshot id was already triggered; go
        // straight to polling.
        let snapshot_id = match &job.external_task_id {
            Some(id) => id.clone(),
            None => {
                let inputs: Vec<ScrapeInput> = job
                    .prompts
                    .iter()
                    .map(|p| ScrapeInput {
                        url: CHAT_URL.to_string(),
                        prompt: p.text.clone(),
                        country: p.geo.clone().or_else(|| job.geo.clone()),
                        web_search: job.web_search,
                    })
                    .collect();

                with_backoff("trigger_scrape", || self.client.trigger_scrape(&inputs))
                    .await?
            }
        };

        let entries = self.client.poll_snapshot(&snapshot_id).await?;
        if entries.is_empty() {
            return Err(Error::UpstreamEmpty(format!(
                "snapshot {snapshot_id} completed with zero results"
            )));
        }
        if entries.len() < job.prompts.len() {
            warn!(
                expected = job.prompts.len(),
                got = entries.len(),
                snapshot_id,
                "snapshot returned fewer results than prompts"
            );
        }

        let volumes = fetch_volumes(self.volume.as_ref(), job).await;

        let mut matched = 0usize;
        for (i, prompt) in job.prompts.iter().enumerate() {
            let entry = entries.iter().find(|e| entry_matches_prompt(e, &prompt.text));
            match entry {
                Some(entry) => {
                    self.process_result(job, prompt, entry, &llm, volumes[i].clone())
                        .await?;
                    matched += 1;
                }
                None => {
                    warn!(prompt_id = %prompt.prompt_id, "no snapshot entry for prompt");
                    if let Some(tracking_id) = prompt.tracking_id {
                        self.db
                            .mark_result_failed(
                                tracking_id,
                                Error::NoResponse(prompt.text.clone()).reason(),
                            )
                            .await?;
                    }
                }
            }
        }

        info!(
            snapshot_id,
            matched,
            total = job.prompts.len(),
            "shard results processed"
        );

        if let Some(ctx) = shard_context(job) {
            let outcome = if matched > 0 {
                ShardOutcome::Completed
            } else {
                ShardOutcome::Failed
            };
            batch::finalize_shard(
                &self.db,
                &self.notifier,
                &ctx,
                outcome,
                (matched == 0).then_some("no snapshot entry matched any prompt"),
            )
            .await?;
        }

        Ok(())
    }
}
