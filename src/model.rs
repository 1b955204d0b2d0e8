use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// The two upstream scraping providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Brightdata,
    Dataforseo,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Brightdata => "brightdata",
            ProviderKind::Dataforseo => "dataforseo",
        }
    }

    /// Queue topic this provider's dispatcher drains.
    pub fn topic(&self) -> &'static str {
        self.as_str()
    }

    /// `source` value stamped on tracking rows produced by this provider.
    pub fn source(&self, nightly: bool) -> &'static str {
        match (self, nightly) {
            (ProviderKind::Brightdata, false) => "brightdata",
            (ProviderKind::Brightdata, true) => "brightdata-nightly",
            (ProviderKind::Dataforseo, false) => "dataforseo",
            (ProviderKind::Dataforseo, true) => "dataforseo-nightly",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "brightdata" => Ok(ProviderKind::Brightdata),
            "dataforseo" => Ok(ProviderKind::Dataforseo),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Lifecycle of a job batch (one API submission).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::CompletedWithErrors | BatchStatus::Failed
        )
    }
}

/// Lifecycle of a single tracking result. Monotone:
/// pending -> processing -> {fulfilled, failed}; a fulfilled row is
/// never downgraded by a late failure callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Pending,
    Processing,
    Fulfilled,
    Failed,
}

impl ResultStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResultStatus::Fulfilled | ResultStatus::Failed)
    }
}

/// Per-project nightly re-run cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl SchedulerFrequency {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(SchedulerFrequency::Daily),
            "weekly" => Some(SchedulerFrequency::Weekly),
            "monthly" => Some(SchedulerFrequency::Monthly),
            _ => None,
        }
    }

    /// Minimum elapsed time before the project is due again.
    pub fn min_interval(&self) -> chrono::Duration {
        match self {
            SchedulerFrequency::Daily => chrono::Duration::hours(24),
            SchedulerFrequency::Weekly => chrono::Duration::days(7),
            SchedulerFrequency::Monthly => chrono::Duration::days(30),
        }
    }
}

/// Primary search-intent classification of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentCategory {
    Informational,
    Commercial,
    Transactional,
    Local,
    Navigational,
}

impl IntentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentCategory::Informational => "informational",
            IntentCategory::Commercial => "commercial",
            IntentCategory::Transactional => "transactional",
            IntentCategory::Local => "local",
            IntentCategory::Navigational => "navigational",
        }
    }
}

/// A cited source, normalized: `domain` is the bare host, `url` keeps
/// the path but loses scheme, `www.`, query and fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub domain: String,
    pub url: String,
}

/// One month of AI search volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyTrend {
    pub year: i32,
    pub month: u32,
    pub volume: i64,
}

/// Aggregated volume data for one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeData {
    pub current_volume: i64,
    pub monthly_trends: Vec<MonthlyTrend>,
    pub average_volume: f64,
    pub peak_volume: i64,
}

/// A project owned by a user; cadence drives nightly re-runs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub scheduler_frequency: Option<String>,
    pub last_nightly_run_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn frequency(&self) -> Option<SchedulerFrequency> {
        self.scheduler_frequency
            .as_deref()
            .and_then(SchedulerFrequency::parse)
    }
}

/// A tracked prompt.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Prompt {
    pub id: Uuid,
    pub project_id: String,
    pub user_id: String,
    pub text: String,
    pub enabled: bool,
    pub brand_mentions: Json<Vec<String>>,
    pub domain_mentions: Json<Vec<String>>,
    pub geo: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The aggregate tracking a single API submission.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobBatch {
    pub id: Uuid,
    pub user_id: String,
    pub project_id: String,
    pub email: Option<String>,
    pub total_prompts: i32,
    pub total_batches: i32,
    pub completed_batches: i32,
    pub failed_batches: i32,
    pub status: BatchStatus,
    pub openai_model: String,
    pub web_search: bool,
    pub geo: Option<String>,
    pub brand_mentions: Json<Vec<String>>,
    pub domain_mentions: Json<Vec<String>>,
    pub tags: Json<Vec<String>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobBatch {
    /// Invariant check: counters never exceed the shard count.
    pub fn counters_consistent(&self) -> bool {
        self.completed_batches + self.failed_batches <= self.total_batches
    }
}

/// One row per prompt per submission.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TrackingResult {
    pub id: Uuid,
    pub prompt_id: Uuid,
    pub prompt_text: String,
    pub project_id: String,
    pub user_id: String,
    pub job_batch_id: Option<Uuid>,
    pub batch_number: i32,
    pub external_task_id: Option<String>,
    pub status: ResultStatus,
    pub is_present: Option<bool>,
    pub is_domain_present: Option<bool>,
    pub sentiment: Option<i32>,
    pub salience: Option<i32>,
    pub response: Option<Json<serde_json::Value>>,
    pub citations: Option<Json<Vec<Citation>>>,
    pub mention_count: Option<i32>,
    pub domain_mention_count: Option<i32>,
    pub web_search: Option<bool>,
    pub lcp: Option<i32>,
    pub actionability: Option<i32>,
    pub intent_classification: Option<String>,
    pub serp: Option<Json<serde_json::Value>>,
    pub ai_search_volume: Option<i64>,
    pub ai_monthly_trends: Option<Json<Vec<MonthlyTrend>>>,
    pub ai_volume_fetched_at: Option<DateTime<Utc>>,
    pub ai_volume_location_code: Option<i32>,
    pub timestamp: i64,
    pub source: Option<String>,
}

/// One prompt inside a queued shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptJob {
    pub prompt_id: Uuid,
    /// Pre-created pending row to update. Absent for nightly runs,
    /// where the dispatcher inserts a fresh row instead.
    pub tracking_id: Option<Uuid>,
    pub text: String,
    pub brand_mentions: Vec<String>,
    pub domain_mentions: Vec<String>,
    pub geo: Option<String>,
}

/// Queue message: one shard of a job, bound to one provider topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardJob {
    pub service: ProviderKind,
    pub nightly: bool,
    /// Snapshot id from a previous trigger of this shard, when known.
    /// A payload that carries one is polled, not re-triggered.
    #[serde(default)]
    pub external_task_id: Option<String>,
    pub user_id: String,
    pub project_id: String,
    pub email: Option<String>,
    pub job_batch_id: Option<Uuid>,
    pub batch_number: i32,
    pub total_batches: i32,
    pub openai_key: String,
    pub openai_model: String,
    pub web_search: bool,
    pub geo: Option<String>,
    pub prompts: Vec<PromptJob>,
}

/// Volume data ready to stamp onto a tracking row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeStamp {
    pub data: VolumeData,
    pub location_code: i32,
    pub fetched_at: DateTime<Utc>,
}

/// Full enrichment payload written when a row is fulfilled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingUpdate {
    pub response: serde_json::Value,
    pub citations: Vec<Citation>,
    pub is_present: bool,
    pub is_domain_present: bool,
    pub mention_count: i32,
    pub domain_mention_count: i32,
    pub sentiment: i32,
    pub salience: i32,
    pub lcp: i32,
    pub actionability: i32,
    pub intent_classification: String,
    pub serp: serde_json::Value,
    pub web_search: bool,
    pub source: String,
    pub volume: Option<VolumeStamp>,
}

/// Brand/domain mention lists arrive from clients either as a single
/// string or as an array. Normalized to an ordered sequence on ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => {
                if s.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![s]
                }
            }
            OneOrMany::Many(v) => v
                .into_iter()
                .filter(|s| !s.trim().is_empty())
                .collect(),
        }
    }
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
