/*!
Enrichment engine.

Takes the provider-agnostic [`NormalizedResponse`] a dispatcher built
plus the prompt's brand/domain lists, and produces everything stamped
onto a fulfilled tracking row: sanitized answer, presence counts,
feature map, LCP, actionability, intent, and the two LLM scores.

The deterministic part is pure CPU; only sentiment/salience suspend.
*/

pub mod analysis;
pub mod brands;
pub mod features;
pub mod intent;
pub mod scores;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::model::{Citation, TrackingUpdate, VolumeStamp};
use crate::openai::OpenAiClient;
use crate::sanitize::sanitize;
use crate::urls;

pub use analysis::AnalysisScores;
pub use intent::IntentResult;

/// A citation as the provider reported it.
#[derive(Debug, Clone)]
pub struct RawCitation {
    pub title: String,
    pub url: String,
    pub date: Option<DateTime<Utc>>,
}

/// Provider-agnostic response envelope. Each dispatcher flattens its
/// provider's wire shape into this before enrichment.
#[derive(Debug, Clone)]
pub struct NormalizedResponse {
    /// Raw (markdown) answer text.
    pub answer_text: String,
    pub citations: Vec<RawCitation>,
    /// Attached link URLs, when the provider reports them separately.
    pub link_urls: Vec<String>,
    pub has_sources_list: bool,
    pub has_products: bool,
    pub has_image_items: bool,
    pub has_local_items: bool,
    pub location: Option<String>,
    /// Whether the answer actually used web search.
    pub web_search: bool,
    /// Provider envelope persisted as `response.raw_response`.
    pub raw: Value,
}

/// Deterministic enrichment output, before LLM scoring.
#[derive(Debug, Clone)]
pub struct Enrichment {
    pub answer_text: String,
    pub citations: Vec<Citation>,
    pub is_present: bool,
    pub mention_count: i32,
    pub is_domain_present: bool,
    pub domain_mention_count: i32,
    pub serp: BTreeMap<String, u32>,
    pub lcp: i32,
    pub actionability: i32,
    pub intent: IntentResult,
    pub scores: AnalysisScores,
    pub web_search: bool,
}

/// Normalize provider citations to `{title, domain, url}`.
pub fn normalize_citations(raw: &[RawCitation]) -> Vec<Citation> {
    raw.iter()
        .filter_map(|c| {
            let domain = urls::hostname(&c.url)?;
            Some(Citation {
                title: c.title.clone(),
                domain,
                url: urls::strip_url(&c.url),
            })
        })
        .collect()
}

/// Run every deterministic scorer. `now` is injected so recency windows
/// are testable.
pub fn enrich_deterministic(
    response: &NormalizedResponse,
    brand_mentions: &[String],
    domain_mentions: &[String],
    now: DateTime<Utc>,
) -> Enrichment {
    let answer_text = sanitize(&response.answer_text);

    let brand_stats = brands::brand_presence(&answer_text, brand_mentions);

    // Citation hosts plus attached-link hosts, duplicates kept: the
    // match count reflects how often the domain shows up.
    let mut hosts: Vec<String> = response
        .citations
        .iter()
        .filter_map(|c| urls::hostname(&c.url))
        .collect();
    hosts.extend(response.link_urls.iter().filter_map(|u| urls::hostname(u)));
    let domain_stats = brands::domain_presence(&hosts, domain_mentions);

    let serp = features::detect_features(response);
    let lcp = scores::lcp(response, &serp, now);
    let actionability = scores::actionability(response, &serp, now);
    let intent = intent::classify(&answer_text.to_lowercase(), &serp);

    Enrichment {
        answer_text,
        citations: normalize_citations(&response.citations),
        is_present: brand_stats.any,
        mention_count: brand_stats.total as i32,
        is_domain_present: domain_stats.any,
        domain_mention_count: domain_stats.total as i32,
        serp,
        lcp,
        actionability,
        intent,
        scores: AnalysisScores::absent(),
        web_search: response.web_search,
    }
}

/// Full enrichment: deterministic scoring plus sentiment/salience when
/// a brand matched.
pub async fn enrich(
    llm: &OpenAiClient,
    model: &str,
    response: &NormalizedResponse,
    brand_mentions: &[String],
    domain_mentions: &[String],
) -> Enrichment {
    let mut enrichment =
        enrich_deterministic(response, brand_mentions, domain_mentions, Utc::now());

    if enrichment.is_present {
        enrichment.scores = analysis::sentiment_and_salience(
            llm,
            model,
            brand_mentions,
            &enrichment.answer_text,
        )
        .await;
    }

    enrichment
}

impl Enrichment {
    /// Assemble the persistence payload for a fulfilled row.
    pub fn into_update(
        self,
        raw_response: Value,
        source: &str,
        volume: Option<VolumeStamp>,
    ) -> TrackingUpdate {
        TrackingUpdate {
            response: json!({
                "answer_text": self.answer_text,
                "raw_response": raw_response,
            }),
            citations: self.citations,
            is_present: self.is_present,
            is_domain_present: self.is_domain_present,
            mention_count: self.mention_count,
            domain_mention_count: self.domain_mention_count,
            sentiment: self.scores.sentiment,
            salience: self.scores.salience,
            lcp: self.lcp,
            actionability: self.actionability,
            intent_classification: self.intent.primary.as_str().to_string(),
            serp: serde_json::to_value(&self.serp).unwrap_or(Value::Null),
            web_search: self.web_search,
            source: source.to_string(),
            volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brand_answer() -> NormalizedResponse {
        NormalizedResponse {
            answer_text: "**Acme** is the leading choice. Acme beats rivals on price."
                .to_string(),
            citations: (0..5)
                .map(|i| RawCitation {
                    title: format!("Source {i}"),
                    url: format!("https://www.site{i}.com/articles/review?ref=x"),
                    date: None,
                })
                .collect(),
            link_urls: Vec::new(),
            has_sources_list: false,
            has_products: false,
            has_image_items: false,
            has_local_items: false,
            location: None,
            web_search: true,
            raw: Value::Null,
        }
    }

    #[test]
    fn brand_mentions_are_counted_in_sanitized_text() {
        let enrichment = enrich_deterministic(
            &brand_answer(),
            &["Acme".to_string()],
            &["acme.com".to_string()],
            Utc::now(),
        );
        assert!(enrichment.is_present);
        assert_eq!(enrichment.mention_count, 2);
        assert!(!enrichment.is_domain_present);
        assert_eq!(enrichment.domain_mention_count, 0);
    }

    #[test]
    fn five_distinct_hosts_reach_lcp_forty() {
        let enrichment = enrich_deterministic(&brand_answer(), &[], &[], Utc::now());
        assert!(enrichment.lcp >= 40);
    }

    #[test]
    fn absent_brand_leaves_zero_scores() {
        let enrichment = enrich_deterministic(
            &brand_answer(),
            &["Globex".to_string()],
            &[],
            Utc::now(),
        );
        assert!(!enrichment.is_present);
        assert_eq!(enrichment.mention_count, 0);
        assert_eq!(enrichment.scores.sentiment, 0);
        assert_eq!(enrichment.scores.salience, 0);
    }

    #[test]
    fn citations_are_normalized() {
        let normalized = normalize_citations(&[RawCitation {
            title: "Review".to_string(),
            url: "https://www.example.com/path/to/review?utm=1#frag".to_string(),
            date: None,
        }]);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].domain, "example.com");
        assert_eq!(normalized[0].url, "example.com/path/to/review");
    }

    #[test]
    fn malformed_citation_urls_are_dropped() {
        let normalized = normalize_citations(&[RawCitation {
            title: "Broken".to_string(),
            url: "   ".to_string(),
            date: None,
        }]);
        assert!(normalized.is_empty());
    }

    #[test]
    fn domain_presence_includes_attached_links() {
        let mut response = brand_answer();
        response.link_urls = vec!["https://acme.com/docs".to_string()];
        let enrichment = enrich_deterministic(
            &response,
            &[],
            &["acme.com".to_string()],
            Utc::now(),
        );
        assert!(enrichment.is_domain_present);
        assert_eq!(enrichment.domain_mention_count, 1);
    }

    #[test]
    fn update_payload_keeps_answer_text_retrievable() {
        let enrichment = enrich_deterministic(
            &brand_answer(),
            &["Acme".to_string()],
            &[],
            Utc::now(),
        );
        let update = enrichment.into_update(json!({"provider": "test"}), "brightdata", None);
        assert!(update.response["answer_text"]
            .as_str()
            .unwrap()
            .contains("Acme"));
        assert_eq!(update.response["raw_response"]["provider"], "test");
        assert_eq!(update.source, "brightdata");
        assert_eq!(update.intent_classification, "informational");
    }

    #[test]
    fn fulfilled_scores_stay_in_range() {
        let enrichment = enrich_deterministic(
            &brand_answer(),
            &["Acme".to_string()],
            &["acme.com".to_string()],
            Utc::now(),
        );
        for score in [enrichment.lcp, enrichment.actionability] {
            assert!((0..=100).contains(&score));
        }
        assert!((0..=100).contains(&enrichment.intent.confidence));
    }
}
