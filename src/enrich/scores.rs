/*!
Deterministic content scores: Linked Citation Potential and
actionability. Pure CPU, no suspension points.
*/

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use super::features::{
    FEATURE_IMAGES, FEATURE_LOCAL_BUSINESSES, FEATURE_NAVIGATION_LIST, FEATURE_PRODUCTS,
    FEATURE_TABLE,
};
use super::NormalizedResponse;
use crate::urls::distinct_hostnames;

const LCP_DOMAIN_CAP: i32 = 8;
const LCP_PER_DOMAIN: i32 = 8;
const LCP_RECENT_BONUS: i32 = 10;
const LCP_VARIETY_BONUS: i32 = 10;
const LCP_NAVIGATION_BONUS: i32 = 6;
const RECENT_WINDOW_DAYS: i64 = 90;
const STALE_WINDOW_DAYS: i64 = 365;

/// Distinct hostnames cited by a response: citation hosts plus attached
/// link hosts when the provider supplies them.
pub fn cited_hostnames(response: &NormalizedResponse) -> Vec<String> {
    let urls = response
        .citations
        .iter()
        .map(|c| c.url.as_str())
        .chain(response.link_urls.iter().map(String::as_str));
    distinct_hostnames(urls)
}

/// Linked Citation Potential: domain diversity, recency, structural
/// variety. Always an integer in [0, 100].
pub fn lcp(
    response: &NormalizedResponse,
    features: &BTreeMap<String, u32>,
    now: DateTime<Utc>,
) -> i32 {
    let domains = cited_hostnames(response).len() as i32;
    let mut score = domains.min(LCP_DOMAIN_CAP) * LCP_PER_DOMAIN;

    let recent_cutoff = now - Duration::days(RECENT_WINDOW_DAYS);
    if response
        .citations
        .iter()
        .filter_map(|c| c.date)
        .any(|d| d >= recent_cutoff)
    {
        score += LCP_RECENT_BONUS;
    }

    if features.len() >= 2 {
        score += LCP_VARIETY_BONUS;
    }

    if features.contains_key(FEATURE_NAVIGATION_LIST) {
        score += LCP_NAVIGATION_BONUS;
    }

    score.clamp(0, 100)
}

/// Actionability: decision-supporting structure plus a staleness
/// opportunity bonus. Always an integer in [0, 100].
pub fn actionability(
    response: &NormalizedResponse,
    features: &BTreeMap<String, u32>,
    now: DateTime<Utc>,
) -> i32 {
    let mut score = 0;
    if features.contains_key(FEATURE_TABLE) {
        score += 30;
    }
    if features.contains_key(FEATURE_PRODUCTS) {
        score += 20;
    }
    if features.contains_key(FEATURE_LOCAL_BUSINESSES) {
        score += 20;
    }
    if features.contains_key(FEATURE_IMAGES) {
        score += 10;
    }
    if features.contains_key(FEATURE_NAVIGATION_LIST) {
        score += 10;
    }

    // Every cited source is old: the topic is due for fresh coverage.
    let most_recent = response.citations.iter().filter_map(|c| c.date).max();
    if let Some(latest) = most_recent {
        if latest < now - Duration::days(STALE_WINDOW_DAYS) {
            score += 10;
        }
    }

    score.clamp(0, 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::{NormalizedResponse, RawCitation};

    fn response_with_hosts(hosts: &[&str]) -> NormalizedResponse {
        NormalizedResponse {
            answer_text: "answer".to_string(),
            citations: hosts
                .iter()
                .map(|h| RawCitation {
                    title: String::new(),
                    url: format!("https://{h}/page"),
                    date: None,
                })
                .collect(),
            link_urls: Vec::new(),
            has_sources_list: false,
            has_products: false,
            has_image_items: false,
            has_local_items: false,
            location: None,
            web_search: false,
            raw: serde_json::Value::Null,
        }
    }

    fn hosts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("site{i}.com")).collect()
    }

    #[test]
    fn lcp_scales_with_distinct_domains() {
        let now = Utc::now();
        let h = hosts(5);
        let refs: Vec<&str> = h.iter().map(String::as_str).collect();
        let response = response_with_hosts(&refs);
        let score = lcp(&response, &BTreeMap::new(), now);
        assert_eq!(score, 40);
    }

    #[test]
    fn lcp_domain_contribution_clamps_at_eight() {
        let now = Utc::now();
        let h = hosts(9);
        let refs: Vec<&str> = h.iter().map(String::as_str).collect();
        let response = response_with_hosts(&refs);
        assert_eq!(lcp(&response, &BTreeMap::new(), now), 64);
    }

    #[test]
    fn lcp_union_includes_attached_links() {
        let now = Utc::now();
        let mut response = response_with_hosts(&["a.com"]);
        response.link_urls = vec![
            "https://b.com/x".to_string(),
            "https://www.a.com/dup".to_string(),
        ];
        // a.com deduped across citations and links: 2 distinct hosts
        assert_eq!(lcp(&response, &BTreeMap::new(), now), 16);
    }

    #[test]
    fn lcp_bonuses_stack_and_clamp() {
        let now = Utc::now();
        let h = hosts(8);
        let refs: Vec<&str> = h.iter().map(String::as_str).collect();
        let mut response = response_with_hosts(&refs);
        response.citations[0].date = Some(now - Duration::days(5));

        let mut features = BTreeMap::new();
        features.insert(super::super::features::FEATURE_TEXT.to_string(), 1);
        features.insert(FEATURE_NAVIGATION_LIST.to_string(), 4);

        // 64 + 10 recent + 10 variety + 6 navigation = 90
        assert_eq!(lcp(&response, &features, now), 90);
    }

    #[test]
    fn old_citations_do_not_earn_recency() {
        let now = Utc::now();
        let mut response = response_with_hosts(&["a.com"]);
        response.citations[0].date = Some(now - Duration::days(120));
        assert_eq!(lcp(&response, &BTreeMap::new(), now), 8);
    }

    #[test]
    fn actionability_sums_features() {
        let now = Utc::now();
        let response = response_with_hosts(&[]);
        let mut features = BTreeMap::new();
        features.insert(FEATURE_TABLE.to_string(), 3);
        features.insert(FEATURE_PRODUCTS.to_string(), 1);
        assert_eq!(actionability(&response, &features, now), 50);
    }

    #[test]
    fn actionability_clamps_at_one_hundred() {
        let now = Utc::now();
        let mut response = response_with_hosts(&["a.com"]);
        response.citations[0].date = Some(now - Duration::days(400));

        let mut features = BTreeMap::new();
        for f in [
            FEATURE_TABLE,
            FEATURE_PRODUCTS,
            FEATURE_LOCAL_BUSINESSES,
            FEATURE_IMAGES,
            FEATURE_NAVIGATION_LIST,
        ] {
            features.insert(f.to_string(), 1);
        }
        // 30+20+20+10+10+10 = 100, clamped at 100
        assert_eq!(actionability(&response, &features, now), 100);
    }

    #[test]
    fn staleness_requires_every_source_old() {
        let now = Utc::now();
        let mut response = response_with_hosts(&["a.com", "b.com"]);
        response.citations[0].date = Some(now - Duration::days(400));
        response.citations[1].date = Some(now - Duration::days(10));
        assert_eq!(actionability(&response, &BTreeMap::new(), now), 0);
    }
}
