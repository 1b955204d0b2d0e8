/*!
Nightly scheduler.

Cron-driven re-runs of enabled prompts for projects with a cadence.
Nightly shards carry no email and no job batch; dispatchers INSERT
fresh rows for them. A process-wide lock keeps runs from overlapping,
and `last_nightly_run_at` is stamped with the run's start time so a
crash can only skip a run, never double it.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::batch::{shard_count, shard_size};
use crate::config::Settings;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::model::{Project, Prompt, PromptJob, ProviderKind, SchedulerFrequency, ShardJob};
use crate::openai::OpenAiClient;
use crate::queue::Queue;
use crate::selector::ProviderSelector;

/// Process-wide singleton lock. Released on every exit path via the
/// RAII guard.
#[derive(Default)]
pub struct NightlyLock {
    running: AtomicBool,
}

pub struct NightlyGuard<'a> {
    lock: &'a NightlyLock,
}

impl NightlyLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<NightlyGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Some(NightlyGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for NightlyGuard<'_> {
    fn drop(&mut self) {
        self.lock.running.store(false, Ordering::SeqCst);
    }
}

/// Whether a project is due under its cadence.
pub fn should_run(
    frequency: Option<SchedulerFrequency>,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let Some(frequency) = frequency else {
        return false;
    };
    match last_run {
        None => true,
        Some(last) => now - last >= frequency.min_interval(),
    }
}

/// Normalize the 5-field cron from the environment to the 6-field
/// (seconds-resolution) syntax the scheduler runs on.
pub fn normalize_cron(expr: &str) -> Result<String> {
    let fields = expr.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {expr}")),
        6 => Ok(expr.to_string()),
        _ => Err(Error::Config(format!(
            "cron expression must have 5 fields, got '{expr}'"
        ))),
    }
}

/// Split a project's enabled prompts into nightly shard jobs.
pub fn nightly_shards(
    project: &Project,
    prompts: &[Prompt],
    service: ProviderKind,
    openai_key: &str,
    openai_model: &str,
) -> Vec<ShardJob> {
    let size = shard_size(prompts.len());
    let total_batches = shard_count(prompts.len()) as i32;

    prompts
        .chunks(size)
        .enumerate()
        .map(|(batch_number, chunk)| ShardJob {
            service,
            nightly: true,
            external_task_id: None,
            user_id: project.user_id.clone(),
            project_id: project.id.clone(),
            email: None,
            job_batch_id: None,
            batch_number: batch_number as i32,
            total_batches,
            openai_key: openai_key.to_string(),
            openai_model: openai_model.to_string(),
            web_search: false,
            geo: None,
            prompts: chunk
                .iter()
                .map(|p| PromptJob {
                    prompt_id: p.id,
                    tracking_id: None,
                    text: p.text.clone(),
                    brand_mentions: p.brand_mentions.0.clone(),
                    domain_mentions: p.domain_mentions.0.clone(),
                    geo: p.geo.clone(),
                })
                .collect(),
        })
        .collect()
}

#[derive(Clone)]
pub struct NightlyRunner {
    db: Database,
    queue: Queue,
    selector: ProviderSelector,
    settings: Arc<Settings>,
    lock: Arc<NightlyLock>,
}

impl NightlyRunner {
    pub fn new(
        db: Database,
        queue: Queue,
        selector: ProviderSelector,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            db,
            queue,
            selector,
            settings,
            lock: Arc::new(NightlyLock::new()),
        }
    }

    /// One scheduler pass. Skips silently when a pass is already
    /// running.
    pub async fn run_once(&self) -> Result<()> {
        let Some(_guard) = self.lock.try_acquire() else {
            warn!("nightly run already in progress, skipping");
            return Ok(());
        };

        let started_at = Utc::now();

        let Some(service) = self.selector.active().await else {
            warn!("no scraping provider healthy, skipping nightly run");
            return Ok(());
        };

        let mut projects = self.db.projects_with_cadence().await?;

        if let Some((test_user, test_project)) = self.settings.testing_filter() {
            projects.retain(|p| p.user_id == test_user && p.id == test_project);
            info!(remaining = projects.len(), "testing mode filter applied");
        }

        let due: Vec<Project> = projects
            .into_iter()
            .filter(|p| should_run(p.frequency(), p.last_nightly_run_at, started_at))
            .collect();

        if due.is_empty() {
            info!("no projects due for a nightly run");
            return Ok(());
        }

        let mut by_user: HashMap<String, Vec<Project>> = HashMap::new();
        for project in due {
            by_user.entry(project.user_id.clone()).or_default().push(project);
        }

        info!(users = by_user.len(), %service, "nightly run starting");

        for (user_id, user_projects) in by_user {
            let Some(openai_key) = self.db.get_openai_key(&user_id).await? else {
                // Users without a stored key are skipped without noise.
                continue;
            };

            let llm = OpenAiClient::new(&openai_key);
            let model = self.settings.default_openai_model.clone();
            if let Err(e) = llm.validate_key(&model).await {
                warn!(user_id, error = %e, "key validation failed, skipping user");
                continue;
            }

            for project in user_projects {
                if let Err(e) = self
                    .run_project(&project, service, &openai_key, &model, started_at)
                    .await
                {
                    error!(project_id = %project.id, error = %e, "nightly project failed");
                }
            }
        }

        info!("nightly run complete");
        Ok(())
    }

    async fn run_project(
        &self,
        project: &Project,
        service: ProviderKind,
        openai_key: &str,
        openai_model: &str,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let prompts = self.db.enabled_prompts(&project.id).await?;
        if prompts.is_empty() {
            return Ok(());
        }

        let shards = nightly_shards(project, &prompts, service, openai_key, openai_model);
        let shard_total = shards.len();

        // Stamp the start time before fan-out: a partial publish must
        // not re-run the project within the same cadence window.
        self.db.stamp_nightly_run(&project.id, started_at).await?;

        for shard in &shards {
            if let Err(e) = self.queue.publish(service.topic(), shard).await {
                error!(
                    project_id = %project.id,
                    batch_number = shard.batch_number,
                    error = %e,
                    "nightly shard publish failed"
                );
            }
        }

        info!(
            project_id = %project.id,
            prompts = prompts.len(),
            shards = shard_total,
            "nightly project queued"
        );
        Ok(())
    }

    /// Register the cron job. Fails (non-zero exit upstream) on an
    /// invalid expression.
    pub async fn start(&self, scheduler: &JobScheduler) -> Result<()> {
        let cron = normalize_cron(&self.settings.nightly_cron_schedule)?;
        let runner = self.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let runner = runner.clone();
            Box::pin(async move {
                if let Err(e) = runner.run_once().await {
                    error!(error = %e, "nightly run failed");
                }
            })
        })
        .map_err(|e| Error::Config(format!("invalid cron '{cron}': {e}")))?;

        scheduler
            .add(job)
            .await
            .map_err(|e| Error::Internal(format!("failed to register nightly job: {e}")))?;

        info!(%cron, "nightly job registered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sqlx::types::Json;
    use uuid::Uuid;

    #[test]
    fn lock_is_exclusive_and_releases_on_drop() {
        let lock = NightlyLock::new();
        let guard = lock.try_acquire().expect("first acquire succeeds");
        assert!(lock.is_running());
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(!lock.is_running());
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn cadence_rules() {
        let now = Utc::now();
        let daily = Some(SchedulerFrequency::Daily);

        assert!(should_run(daily, None, now));
        assert!(should_run(daily, Some(now - Duration::hours(25)), now));
        assert!(!should_run(daily, Some(now - Duration::hours(23)), now));

        let weekly = Some(SchedulerFrequency::Weekly);
        assert!(should_run(weekly, Some(now - Duration::days(8)), now));
        assert!(!should_run(weekly, Some(now - Duration::days(6)), now));

        let monthly = Some(SchedulerFrequency::Monthly);
        assert!(should_run(monthly, Some(now - Duration::days(31)), now));
        assert!(!should_run(monthly, Some(now - Duration::days(29)), now));

        // unknown cadence never runs
        assert!(!should_run(None, None, now));
    }

    #[test]
    fn cron_normalization() {
        assert_eq!(normalize_cron("0 4 * * *").unwrap(), "0 0 4 * * *");
        assert_eq!(normalize_cron("0 0 4 * * *").unwrap(), "0 0 4 * * *");
        assert!(normalize_cron("not a cron").is_err());
    }

    fn prompt(project: &Project, text: &str) -> Prompt {
        Prompt {
            id: Uuid::new_v4(),
            project_id: project.id.clone(),
            user_id: project.user_id.clone(),
            text: text.to_string(),
            enabled: true,
            brand_mentions: Json(vec!["Acme".to_string()]),
            domain_mentions: Json(vec![]),
            geo: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn nightly_shards_carry_the_nightly_envelope() {
        let project = Project {
            id: "project-1".to_string(),
            user_id: "user-1".to_string(),
            name: "Demo".to_string(),
            scheduler_frequency: Some("daily".to_string()),
            last_nightly_run_at: None,
        };
        let prompts: Vec<Prompt> = (0..12)
            .map(|i| prompt(&project, &format!("prompt {i}")))
            .collect();

        let shards = nightly_shards(
            &project,
            &prompts,
            ProviderKind::Brightdata,
            "sk-user",
            "gpt-4o-mini",
        );

        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].prompts.len(), 10);
        assert_eq!(shards[1].prompts.len(), 2);
        for shard in &shards {
            assert!(shard.nightly);
            assert!(shard.email.is_none());
            assert!(shard.job_batch_id.is_none());
            assert!(!shard.web_search);
            for p in &shard.prompts {
                assert!(p.tracking_id.is_none());
                assert_eq!(p.brand_mentions, vec!["Acme".to_string()]);
            }
        }
    }
}
