/*!
Bright Data scraping client (provider A).

A shard is submitted as one dataset trigger covering every prompt; the
returned snapshot id is polled until the provider serves a JSON array
of per-prompt results.
*/

use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::enrich::{NormalizedResponse, RawCitation};
use crate::error::{Error, Result};
use crate::metrics;

const TRIGGER_URL: &str = "https://api.brightdata.com/datasets/v3/trigger";
const SNAPSHOT_URL: &str = "https://api.brightdata.com/datasets/v3/snapshot";

/// One prompt in a dataset trigger.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeInput {
    pub url: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub web_search: bool,
}

#[derive(Deserialize)]
struct TriggerResponse {
    snapshot_id: String,
}

/// One entry of a ready snapshot. The provider's shape is loose; every
/// field is optional and unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub answer_text: Option<String>,
    #[serde(default)]
    pub citations: Option<Vec<SnapshotCitation>>,
    #[serde(default)]
    pub links_attached: Option<Vec<AttachedLink>>,
    #[serde(default)]
    pub sources: Option<Vec<Value>>,
    #[serde(default)]
    pub products: Option<Vec<Value>>,
    #[serde(default)]
    pub image_items: Option<Vec<Value>>,
    #[serde(default)]
    pub local_items: Option<Vec<Value>>,
    #[serde(default)]
    pub has_map: Option<bool>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub web_search: Option<bool>,
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCitation {
    #[serde(default)]
    pub title: Option<String>,
    pub url: String,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedLink {
    pub url: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Snapshot polling verdict.
#[derive(Debug)]
pub enum SnapshotState {
    Ready(Vec<SnapshotEntry>),
    Running(String),
    Failed(String),
}

#[derive(Clone)]
pub struct BrightdataClient {
    client: Client,
    api_key: String,
    dataset_id: String,
    poll_interval: Duration,
    poll_max_attempts: u32,
}

impl BrightdataClient {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api_key = settings
            .brightdata_api_key
            .clone()
            .ok_or_else(|| Error::Config("BRIGHTDATA_API_KEY is not set".to_string()))?;
        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap(),
            api_key,
            dataset_id: settings.brightdata_dataset_id.clone(),
            poll_interval: Duration::from_secs(settings.snapshot_poll_interval_secs),
            poll_max_attempts: settings.snapshot_poll_max_attempts,
        })
    }

    /// Trigger one scrape covering the whole shard. Returns the
    /// snapshot id the results will appear under.
    pub async fn trigger_scrape(&self, inputs: &[ScrapeInput]) -> Result<String> {
        let start = Instant::now();
        let response = self
            .client
            .post(TRIGGER_URL)
            .bearer_auth(&self.api_key)
            .query(&[("dataset_id", self.dataset_id.as_str()), ("format", "json")])
            .json(inputs)
            .send()
            .await?;
        metrics::global()
            .provider_latency
            .observe(start.elapsed().as_secs_f64());

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_provider_status(status.as_u16(), &body));
        }

        let parsed: TriggerResponse = response.json().await?;
        info!(snapshot_id = %parsed.snapshot_id, prompts = inputs.len(), "scrape triggered");
        Ok(parsed.snapshot_id)
    }

    /// One snapshot fetch. A JSON array body means the results are
    /// ready; an object carries the build status.
    pub async fn fetch_snapshot(&self, snapshot_id: &str) -> Result<SnapshotState> {
        let url = format!("{SNAPSHOT_URL}/{snapshot_id}");
        let start = Instant::now();
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("format", "json")])
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        metrics::global()
            .provider_latency
            .observe(start.elapsed().as_secs_f64());

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_provider_status(status.as_u16(), &body));
        }

        let body: Value = response.json().await?;
        match body {
            Value::Array(entries) => {
                let parsed = entries
                    .into_iter()
                    .filter_map(|v| serde_json::from_value::<SnapshotEntry>(v).ok())
                    .collect();
                Ok(SnapshotState::Ready(parsed))
            }
            Value::Object(ref map) => {
                let state = map
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                match state.as_str() {
                    "failed" => Ok(SnapshotState::Failed(
                        map.get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("snapshot failed")
                            .to_string(),
                    )),
                    "running" | "building" | "pending" => Ok(SnapshotState::Running(state)),
                    other => Ok(SnapshotState::Running(other.to_string())),
                }
            }
            _ => Err(Error::UpstreamFailed(
                "snapshot body was neither array nor status object".to_string(),
            )),
        }
    }

    /// Poll until the snapshot is ready. The attempt cap bounds the
    /// wall clock at 30 minutes under default settings.
    pub async fn poll_snapshot(&self, snapshot_id: &str) -> Result<Vec<SnapshotEntry>> {
        for attempt in 1..=self.poll_max_attempts {
            match self.fetch_snapshot(snapshot_id).await {
                Ok(SnapshotState::Ready(entries)) => {
                    info!(snapshot_id, entries = entries.len(), "snapshot ready");
                    return Ok(entries);
                }
                Ok(SnapshotState::Failed(reason)) => {
                    return Err(Error::UpstreamFailed(format!(
                        "snapshot {snapshot_id} failed: {reason}"
                    )));
                }
                Ok(SnapshotState::Running(state)) => {
                    debug!(snapshot_id, state, attempt, "snapshot still building");
                }
                Err(e) if e.is_retryable() => {
                    warn!(snapshot_id, attempt, error = %e, "snapshot fetch failed, will re-poll");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        Err(Error::UpstreamFailed(format!(
            "snapshot {snapshot_id} still running after {} polls",
            self.poll_max_attempts
        )))
    }

    /// Debug passthrough: the snapshot entry matching `prompt`.
    pub async fn snapshot_entry_for_prompt(
        &self,
        snapshot_id: &str,
        prompt: &str,
    ) -> Result<SnapshotEntry> {
        match self.fetch_snapshot(snapshot_id).await? {
            SnapshotState::Ready(entries) => entries
                .into_iter()
                .find(|e| entry_matches_prompt(e, prompt))
                .ok_or_else(|| {
                    Error::NotFound(format!("no entry for prompt in snapshot {snapshot_id}"))
                }),
            SnapshotState::Running(state) => Err(Error::NotReady(format!(
                "snapshot {snapshot_id} is still {state}"
            ))),
            SnapshotState::Failed(reason) => Err(Error::UpstreamFailed(reason)),
        }
    }
}

fn classify_provider_status(status: u16, body: &str) -> Error {
    if status == 429 || status >= 500 {
        Error::RetryableUpstream(format!("Bright Data {status}: {body}"))
    } else {
        Error::UpstreamFailed(format!("Bright Data {status}: {body}"))
    }
}

/// Match a snapshot entry to a prompt by the echoed input prompt or by
/// text equality on the entry itself.
pub fn entry_matches_prompt(entry: &SnapshotEntry, prompt: &str) -> bool {
    if let Some(p) = &entry.prompt {
        if p.trim() == prompt.trim() {
            return true;
        }
    }
    entry
        .input
        .as_ref()
        .and_then(|input| input.get("prompt"))
        .and_then(Value::as_str)
        .map(|p| p.trim() == prompt.trim())
        .unwrap_or(false)
}

fn parse_citation_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Flatten a snapshot entry into the provider-agnostic envelope the
/// enrichment engine consumes.
pub fn normalize_entry(entry: &SnapshotEntry, requested_web_search: bool) -> NormalizedResponse {
    let citations = entry
        .citations
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|c| RawCitation {
            title: c.title.clone().unwrap_or_default(),
            url: c.url.clone(),
            date: c.date.as_deref().and_then(parse_citation_date),
        })
        .collect();

    let link_urls = entry
        .links_attached
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|l| l.url.clone())
        .collect();

    NormalizedResponse {
        answer_text: entry.answer_text.clone().unwrap_or_default(),
        citations,
        link_urls,
        has_sources_list: entry.sources.as_deref().map(|s| !s.is_empty()).unwrap_or(false),
        has_products: entry.products.as_deref().map(|p| !p.is_empty()).unwrap_or(false),
        has_image_items: entry
            .image_items
            .as_deref()
            .map(|i| !i.is_empty())
            .unwrap_or(false),
        has_local_items: entry.has_map.unwrap_or(false)
            || entry
                .local_items
                .as_deref()
                .map(|l| !l.is_empty())
                .unwrap_or(false),
        location: entry.country.clone(),
        web_search: entry.web_search.unwrap_or(requested_web_search),
        raw: serde_json::to_value(entry).unwrap_or(Value::Null),
    }
}
