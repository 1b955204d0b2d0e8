/*!
Structural feature detection on the raw (pre-sanitization) response.
*/

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use super::NormalizedResponse;

pub const FEATURE_TEXT: &str = "text";
pub const FEATURE_PRODUCTS: &str = "products";
pub const FEATURE_IMAGES: &str = "images";
pub const FEATURE_TABLE: &str = "table";
pub const FEATURE_NAVIGATION_LIST: &str = "navigation_list";
pub const FEATURE_LOCAL_BUSINESSES: &str = "local_businesses";

static MD_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static TABLE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\|.*\|\s*$").unwrap());

const NAVIGATION_LINK_THRESHOLD: usize = 3;
const TABLE_MIN_LINES: usize = 3;

/// Detected features with occurrence counts. Only detected features
/// appear in the map.
pub fn detect_features(response: &NormalizedResponse) -> BTreeMap<String, u32> {
    let mut features = BTreeMap::new();

    if !response.answer_text.trim().is_empty() {
        features.insert(FEATURE_TEXT.to_string(), 1);
    }

    if response.has_products {
        features.insert(FEATURE_PRODUCTS.to_string(), 1);
    }

    let image_count = MD_IMAGE.find_iter(&response.answer_text).count() as u32;
    if image_count > 0 {
        features.insert(FEATURE_IMAGES.to_string(), image_count);
    } else if response.has_image_items {
        features.insert(FEATURE_IMAGES.to_string(), 1);
    }

    // header + separator + at least one data row
    let table_lines = TABLE_LINE.find_iter(&response.answer_text).count();
    if table_lines >= TABLE_MIN_LINES {
        features.insert(FEATURE_TABLE.to_string(), table_lines as u32);
    }

    if response.link_urls.len() > NAVIGATION_LINK_THRESHOLD {
        features.insert(
            FEATURE_NAVIGATION_LIST.to_string(),
            response.link_urls.len() as u32,
        );
    } else if response.has_sources_list {
        features.insert(FEATURE_NAVIGATION_LIST.to_string(), 1);
    }

    if response.has_local_items {
        features.insert(FEATURE_LOCAL_BUSINESSES.to_string(), 1);
    }

    features
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(answer: &str) -> NormalizedResponse {
        NormalizedResponse {
            answer_text: answer.to_string(),
            citations: Vec::new(),
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

    #[test]
    fn empty_answer_has_no_features() {
        assert!(detect_features(&response("   ")).is_empty());
    }

    #[test]
    fn plain_text_detects_only_text() {
        let features = detect_features(&response("A plain answer."));
        assert_eq!(features.len(), 1);
        assert_eq!(features.get(FEATURE_TEXT), Some(&1));
    }

    #[test]
    fn markdown_images_are_counted() {
        let features = detect_features(&response(
            "Look: ![chart](https://a.com/1.png) and ![photo](https://a.com/2.png)",
        ));
        assert_eq!(features.get(FEATURE_IMAGES), Some(&2));
    }

    #[test]
    fn table_requires_three_pipe_lines() {
        let two_lines = "| a | b |\n|---|---|";
        assert!(detect_features(&response(two_lines))
            .get(FEATURE_TABLE)
            .is_none());

        let full = "| a | b |\n|---|---|\n| 1 | 2 |";
        assert_eq!(detect_features(&response(full)).get(FEATURE_TABLE), Some(&3));
    }

    #[test]
    fn navigation_list_from_links_or_sources() {
        let mut r = response("answer");
        r.link_urls = (0..4).map(|i| format!("https://site{i}.com")).collect();
        assert_eq!(
            detect_features(&r).get(FEATURE_NAVIGATION_LIST),
            Some(&4)
        );

        let mut r = response("answer");
        r.link_urls = vec!["https://one.com".to_string()];
        r.has_sources_list = true;
        assert_eq!(
            detect_features(&r).get(FEATURE_NAVIGATION_LIST),
            Some(&1)
        );

        let mut r = response("answer");
        r.link_urls = vec!["https://one.com".to_string()];
        assert!(detect_features(&r).get(FEATURE_NAVIGATION_LIST).is_none());
    }

    #[test]
    fn provider_flags_surface_products_and_local() {
        let mut r = response("answer");
        r.has_products = true;
        r.has_local_items = true;
        let features = detect_features(&r);
        assert_eq!(features.get(FEATURE_PRODUCTS), Some(&1));
        assert_eq!(features.get(FEATURE_LOCAL_BUSINESSES), Some(&1));
    }
}
