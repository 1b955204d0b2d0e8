/*!
AI keyword volume client.

One batched lookup per shard; results are re-aligned index-for-index
with the input prompts. Zero-volume keywords are valid data, not
misses.
*/

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::model::{MonthlyTrend, VolumeData};

const VOLUME_URL: &str =
    "https://api.dataforseo.com/v3/ai_optimization/ai_keyword_data/keywords_search_volume/live";

/// Batched lookups are capped; prompts beyond the cap resolve to null.
pub const MAX_KEYWORDS: usize = 50;
const MAX_TREND_MONTHS: usize = 12;

#[derive(Clone)]
pub struct VolumeClient {
    client: Client,
    login: String,
    password: String,
}

#[derive(Serialize)]
struct VolumeRequest<'a> {
    keywords: Vec<&'a str>,
    location_code: i32,
    language_name: &'a str,
}

#[derive(Deserialize)]
struct VolumeResponse {
    #[serde(default)]
    tasks: Vec<VolumeTask>,
}

#[derive(Deserialize)]
struct VolumeTask {
    #[serde(default)]
    result: Option<Vec<VolumeResult>>,
}

#[derive(Deserialize)]
struct VolumeResult {
    #[serde(default)]
    items: Option<Vec<VolumeItem>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeItem {
    pub keyword: String,
    #[serde(default)]
    pub ai_search_volume: Option<i64>,
    #[serde(default)]
    pub ai_monthly_searches: Option<Vec<MonthlySearch>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonthlySearch {
    pub year: i32,
    pub month: u32,
    #[serde(default)]
    pub ai_search_volume: Option<i64>,
}

impl VolumeClient {
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let login = settings.dataforseo_login.clone()?;
        let password = settings.dataforseo_password.clone()?;
        Some(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap(),
            login,
            password,
        })
    }

    /// Look up AI search volume for each prompt. The output is aligned
    /// index-for-index with `prompts`; an element is None when the
    /// provider had no data for that prompt.
    pub async fn batch_volumes(
        &self,
        prompts: &[String],
        location_code: i32,
    ) -> Result<Vec<Option<VolumeData>>> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }

        let lowered: Vec<String> = prompts.iter().map(|p| p.trim().to_lowercase()).collect();

        let mut unique: Vec<&str> = Vec::new();
        for keyword in &lowered {
            if !unique.contains(&keyword.as_str()) {
                unique.push(keyword);
            }
        }
        if unique.len() > MAX_KEYWORDS {
            warn!(
                total = unique.len(),
                cap = MAX_KEYWORDS,
                "keyword batch truncated"
            );
            unique.truncate(MAX_KEYWORDS);
        }

        let body = vec![VolumeRequest {
            keywords: unique,
            location_code,
            language_name: "English",
        }];

        let response = self
            .client
            .post(VOLUME_URL)
            .basic_auth(&self.login, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        match status.as_u16() {
            401 => return Err(Error::AuthFailed("volume API rejected credentials".to_string())),
            402 => return Err(Error::QuotaExceeded("volume API credits exhausted".to_string())),
            429 => return Err(Error::RetryableUpstream("volume API rate limited".to_string())),
            _ => {}
        }
        if !status.is_success() {
            // Aligned nulls: a failed lookup degrades the batch, it does
            // not fail the shard.
            warn!(%status, "volume lookup failed, returning nulls");
            return Ok(vec![None; prompts.len()]);
        }

        let parsed: VolumeResponse = response.json().await?;
        let items: Vec<VolumeItem> = parsed
            .tasks
            .into_iter()
            .filter_map(|t| t.result)
            .flatten()
            .filter_map(|r| r.items)
            .flatten()
            .collect();

        debug!(items = items.len(), "volume items received");
        Ok(align_volumes(&lowered, &items))
    }
}

/// Group provider items by lowercase keyword and aggregate each input
/// prompt's matches.
pub fn align_volumes(lowered_prompts: &[String], items: &[VolumeItem]) -> Vec<Option<VolumeData>> {
    let mut by_keyword: HashMap<&str, Vec<&VolumeItem>> = HashMap::new();
    for item in items {
        by_keyword.entry(item.keyword.as_str()).or_default().push(item);
    }

    lowered_prompts
        .iter()
        .map(|prompt| {
            by_keyword
                .get(prompt.as_str())
                .map(|matched| aggregate_volume(matched))
        })
        .collect()
}

/// Sum volumes across matched items, fold their monthly series into a
/// per-(year, month) series sorted newest first.
pub fn aggregate_volume(items: &[&VolumeItem]) -> VolumeData {
    let current_volume: i64 = items.iter().filter_map(|i| i.ai_search_volume).sum();

    let mut by_month: HashMap<(i32, u32), i64> = HashMap::new();
    for item in items {
        for search in item.ai_monthly_searches.as_deref().unwrap_or_default() {
            *by_month.entry((search.year, search.month)).or_insert(0) +=
                search.ai_search_volume.unwrap_or(0);
        }
    }

    let mut monthly_trends: Vec<MonthlyTrend> = by_month
        .into_iter()
        .map(|((year, month), volume)| MonthlyTrend {
            year,
            month,
            volume,
        })
        .collect();
    monthly_trends.sort_by(|a, b| (b.year, b.month).cmp(&(a.year, a.month)));
    monthly_trends.truncate(MAX_TREND_MONTHS);

    let average_volume = if monthly_trends.is_empty() {
        0.0
    } else {
        monthly_trends.iter().map(|t| t.volume as f64).sum::<f64>()
            / monthly_trends.len() as f64
    };
    let peak_volume = monthly_trends.iter().map(|t| t.volume).max().unwrap_or(0);

    VolumeData {
        current_volume,
        monthly_trends,
        average_volume,
        peak_volume,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(keyword: &str, volume: i64, months: &[(i32, u32, i64)]) -> VolumeItem {
        VolumeItem {
            keyword: keyword.to_string(),
            ai_search_volume: Some(volume),
            ai_monthly_searches: Some(
                months
                    .iter()
                    .map(|&(year, month, v)| MonthlySearch {
                        year,
                        month,
                        ai_search_volume: Some(v),
                    })
                    .collect(),
            ),
        }
    }

    #[test]
    fn aligns_index_for_index_with_nulls_for_misses() {
        let prompts = vec!["best crm".to_string(), "unknown keyword".to_string()];
        let items = vec![item("best crm", 900, &[(2026, 7, 900)])];
        let aligned = align_volumes(&prompts, &items);
        assert_eq!(aligned.len(), 2);
        assert!(aligned[0].is_some());
        assert!(aligned[1].is_none());
    }

    #[test]
    fn duplicate_prompts_share_the_same_data() {
        let prompts = vec!["best crm".to_string(), "best crm".to_string()];
        let items = vec![item("best crm", 500, &[(2026, 7, 500)])];
        let aligned = align_volumes(&prompts, &items);
        assert_eq!(aligned[0], aligned[1]);
    }

    #[test]
    fn aggregates_sum_group_and_sort_newest_first() {
        let a = item("k", 100, &[(2026, 6, 40), (2026, 7, 60)]);
        let b = item("k", 50, &[(2026, 7, 10), (2025, 12, 5)]);
        let data = aggregate_volume(&[&a, &b]);

        assert_eq!(data.current_volume, 150);
        assert_eq!(data.monthly_trends.len(), 3);
        // newest first
        assert_eq!(data.monthly_trends[0].year, 2026);
        assert_eq!(data.monthly_trends[0].month, 7);
        assert_eq!(data.monthly_trends[0].volume, 70);
        assert_eq!(data.monthly_trends[2].year, 2025);
        assert_eq!(data.peak_volume, 70);
        let expected_avg = (70 + 40 + 5) as f64 / 3.0;
        assert!((data.average_volume - expected_avg).abs() < f64::EPSILON);
    }

    #[test]
    fn trends_are_capped_at_twelve_months() {
        let months: Vec<(i32, u32, i64)> = (1..=14).map(|m| (2025, m as u32, 10)).collect();
        let a = item("k", 10, &months);
        let data = aggregate_volume(&[&a]);
        assert_eq!(data.monthly_trends.len(), 12);
        // the newest 12 survive: months 3..=14
        assert_eq!(data.monthly_trends.last().unwrap().month, 3);
    }

    #[test]
    fn zero_volume_is_valid_data() {
        let a = VolumeItem {
            keyword: "k".to_string(),
            ai_search_volume: Some(0),
            ai_monthly_searches: Some(vec![]),
        };
        let data = aggregate_volume(&[&a]);
        assert_eq!(data.current_volume, 0);
        assert_eq!(data.peak_volume, 0);
        let aligned = align_volumes(&["k".to_string()], &[a]);
        assert!(aligned[0].is_some());
    }
}
