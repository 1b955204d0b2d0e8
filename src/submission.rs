/*!
Submission API.

Validates an enqueue request, probes the OpenAI key, picks the active
provider, creates the batch + pending rows transactionally, then fans
shard messages out to the provider topic. Fan-out is fire-and-forget:
a failed publish is logged and the remaining shards continue.
*/

use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::batch::{shard_count, shard_size};
use crate::database::{Database, NewSubmission};
use crate::error::{Error, Result};
use crate::model::{BatchStatus, OneOrMany, PromptJob, ProviderKind, ShardJob};
use crate::openai::OpenAiClient;
use crate::queue::Queue;
use crate::selector::ProviderSelector;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(default)]
    pub brand_mentions: OneOrMany,
    #[serde(default)]
    pub domain_mentions: OneOrMany,
    #[serde(default)]
    pub geo: Option<String>,
    #[serde(default)]
    pub openai_key: String,
    #[serde(default)]
    pub openai_model: Option<String>,
    #[serde(default)]
    pub web_search: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub job_batch_id: Uuid,
    pub total_prompts: usize,
    pub total_batches: usize,
    pub service: ProviderKind,
}

/// Field-presence validation; everything else is the provider probe's
/// job.
pub fn validate(request: &EnqueueRequest) -> Result<()> {
    if request.project.trim().is_empty() {
        return Err(Error::InvalidRequest("project is required".to_string()));
    }
    if request.user.trim().is_empty() {
        return Err(Error::InvalidRequest("user is required".to_string()));
    }
    if request.prompts.iter().all(|p| p.trim().is_empty()) {
        return Err(Error::InvalidRequest(
            "at least one prompt is required".to_string(),
        ));
    }
    if request.openai_key.trim().is_empty() {
        return Err(Error::InvalidRequest("openaiKey is required".to_string()));
    }
    Ok(())
}

/// Split created prompt/tracking ids into provider-bound shard jobs.
pub fn build_shard_jobs(
    request: &EnqueueRequest,
    service: ProviderKind,
    job_batch_id: Uuid,
    openai_model: &str,
    prompts: &[String],
    prompt_ids: &[Uuid],
    tracking_ids: &[Uuid],
    brand_mentions: &[String],
    domain_mentions: &[String],
) -> Vec<ShardJob> {
    let size = shard_size(prompts.len());
    let total_batches = shard_count(prompts.len()) as i32;

    prompts
        .chunks(size)
        .enumerate()
        .map(|(batch_number, chunk)| {
            let start = batch_number * size;
            let prompt_jobs: Vec<PromptJob> = chunk
                .iter()
                .enumerate()
                .map(|(offset, text)| PromptJob {
                    prompt_id: prompt_ids[start + offset],
                    tracking_id: Some(tracking_ids[start + offset]),
                    text: text.clone(),
                    brand_mentions: brand_mentions.to_vec(),
                    domain_mentions: domain_mentions.to_vec(),
                    geo: request.geo.clone(),
                })
                .collect();

            ShardJob {
                service,
                nightly: false,
                external_task_id: None,
                user_id: request.user.clone(),
                project_id: request.project.clone(),
                email: request.email.clone(),
                job_batch_id: Some(job_batch_id),
                batch_number: batch_number as i32,
                total_batches,
                openai_key: request.openai_key.clone(),
                openai_model: openai_model.to_string(),
                web_search: request.web_search,
                geo: request.geo.clone(),
                prompts: prompt_jobs,
            }
        })
        .collect()
}

/// Full enqueue flow.
pub async fn enqueue(
    db: &Database,
    selector: &ProviderSelector,
    queue: &Queue,
    default_model: &str,
    request: EnqueueRequest,
) -> Result<EnqueueResponse> {
    validate(&request)?;

    let prompts: Vec<String> = request
        .prompts
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    let openai_model = request
        .openai_model
        .clone()
        .unwrap_or_else(|| default_model.to_string());

    // Probe the key before creating anything durable.
    let llm = OpenAiClient::new(&request.openai_key);
    llm.validate_key(&openai_model).await?;

    let Some(service) = selector.active().await else {
        return Err(Error::AllProvidersDown);
    };

    let brand_mentions = request.brand_mentions.clone().into_vec();
    let domain_mentions = request.domain_mentions.clone().into_vec();

    let tag_ids = db.upsert_tags(&request.project, &request.tags).await?;

    let total_batches = shard_count(prompts.len()) as i32;
    let created = db
        .create_submission(&NewSubmission {
            user_id: request.user.clone(),
            project_id: request.project.clone(),
            email: request.email.clone(),
            openai_key: request.openai_key.clone(),
            openai_model: openai_model.clone(),
            web_search: request.web_search,
            geo: request.geo.clone(),
            brand_mentions: brand_mentions.clone(),
            domain_mentions: domain_mentions.clone(),
            tags: request.tags.clone(),
            prompts: prompts.clone(),
            total_batches,
            shard_size: shard_size(prompts.len()),
        })
        .await?;

    if !tag_ids.is_empty() {
        db.attach_tags(&created.prompt_ids, &tag_ids).await?;
    }

    db.set_batch_status(created.job_batch_id, BatchStatus::Processing)
        .await?;

    let shards = build_shard_jobs(
        &request,
        service,
        created.job_batch_id,
        &openai_model,
        &prompts,
        &created.prompt_ids,
        &created.tracking_ids,
        &brand_mentions,
        &domain_mentions,
    );

    for shard in &shards {
        if let Err(e) = queue.publish(service.topic(), shard).await {
            // Fire-and-forget: those rows stay pending until an operator
            // requeues them.
            error!(
                job_batch_id = %created.job_batch_id,
                batch_number = shard.batch_number,
                error = %e,
                "shard publish failed"
            );
        }
    }

    info!(
        job_batch_id = %created.job_batch_id,
        prompts = prompts.len(),
        batches = shards.len(),
        %service,
        "submission enqueued"
    );

    Ok(EnqueueResponse {
        job_batch_id: created.job_batch_id,
        total_prompts: prompts.len(),
        total_batches: shards.len(),
        service,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompts: &[&str]) -> EnqueueRequest {
        EnqueueRequest {
            project: "project-1".to_string(),
            user: "user-1".to_string(),
            email: Some("a@b.c".to_string()),
            prompts: prompts.iter().map(|s| s.to_string()).collect(),
            brand_mentions: OneOrMany::Many(vec!["Acme".to_string()]),
            domain_mentions: OneOrMany::Many(vec![]),
            geo: None,
            openai_key: "sk-test".to_string(),
            openai_model: Some("gpt-4o-mini".to_string()),
            web_search: true,
            tags: vec![],
        }
    }

    #[test]
    fn validation_requires_core_fields() {
        assert!(validate(&request(&["p"])).is_ok());

        let mut r = request(&["p"]);
        r.project = String::new();
        assert!(matches!(validate(&r), Err(Error::InvalidRequest(_))));

        let mut r = request(&["p"]);
        r.user = "  ".to_string();
        assert!(matches!(validate(&r), Err(Error::InvalidRequest(_))));

        let mut r = request(&[]);
        r.prompts = vec![];
        assert!(matches!(validate(&r), Err(Error::InvalidRequest(_))));

        let mut r = request(&["p"]);
        r.openai_key = String::new();
        assert!(matches!(validate(&r), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn blank_prompts_do_not_satisfy_the_prompt_requirement() {
        assert!(validate(&request(&["", "  "])).is_err());
        assert!(validate(&request(&["", "real prompt"])).is_ok());
    }

    #[test]
    fn request_deserializes_from_camel_case() {
        let r: EnqueueRequest = serde_json::from_value(serde_json::json!({
            "project": "p1",
            "user": "u1",
            "prompts": ["best crm"],
            "brandMentions": "Acme",
            "domainMentions": ["acme.com"],
            "openaiKey": "sk-x",
            "webSearch": true
        }))
        .unwrap();
        assert_eq!(r.brand_mentions.into_vec(), vec!["Acme".to_string()]);
        assert_eq!(r.domain_mentions.into_vec(), vec!["acme.com".to_string()]);
        assert!(r.web_search);
        assert!(r.openai_model.is_none());
    }

    fn shard_jobs(n: usize) -> Vec<ShardJob> {
        let prompts: Vec<String> = (0..n).map(|i| format!("prompt {i}")).collect();
        let prompt_ids: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        let tracking_ids: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        let texts: Vec<&str> = prompts.iter().map(String::as_str).collect();
        build_shard_jobs(
            &request(&texts),
            ProviderKind::Dataforseo,
            Uuid::new_v4(),
            "gpt-4o-mini",
            &prompts,
            &prompt_ids,
            &tracking_ids,
            &["Acme".to_string()],
            &[],
        )
    }

    #[test]
    fn sharding_matches_the_batch_size_rule() {
        assert_eq!(shard_jobs(1).len(), 1);
        assert_eq!(shard_jobs(4).len(), 1);
        assert_eq!(shard_jobs(4)[0].prompts.len(), 4);
        assert_eq!(shard_jobs(5).len(), 1);
        assert_eq!(shard_jobs(10).len(), 2);
        assert_eq!(shard_jobs(10)[0].prompts.len(), 5);

        let eleven = shard_jobs(11);
        assert_eq!(eleven.len(), 2);
        assert_eq!(eleven[0].prompts.len(), 10);
        assert_eq!(eleven[1].prompts.len(), 1);
        assert_eq!(eleven[1].batch_number, 1);

        let twenty = shard_jobs(20);
        assert_eq!(twenty.len(), 2);
        assert_eq!(twenty[0].prompts.len(), 10);
        assert_eq!(twenty[1].prompts.len(), 10);
    }

    #[test]
    fn shards_carry_credentials_and_mentions() {
        let jobs = shard_jobs(3);
        let job = &jobs[0];
        assert_eq!(job.openai_key, "sk-test");
        assert_eq!(job.total_batches, 1);
        assert!(!job.nightly);
        assert!(job.job_batch_id.is_some());
        for prompt in &job.prompts {
            assert!(prompt.tracking_id.is_some());
            assert_eq!(prompt.brand_mentions, vec!["Acme".to_string()]);
        }
    }
}
