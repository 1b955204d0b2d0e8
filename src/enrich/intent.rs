/*!
Search-intent classification.

Five category scores built from structural features and keyword hits,
informational carrying a fixed baseline. Ties break in the order
commercial, transactional, local, navigational, informational.
*/

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use super::features::{
    FEATURE_LOCAL_BUSINESSES, FEATURE_NAVIGATION_LIST, FEATURE_PRODUCTS, FEATURE_TABLE,
    FEATURE_TEXT,
};
use crate::model::IntentCategory;

const COMMERCIAL_KEYWORDS: &[&str] = &[
    "compare", "review", "rating", "best", "top", "price", "cost", "features", "vs",
    "versus", "pros", "cons", "recommendation", "brand", "model",
];
const LOCAL_KEYWORDS: &[&str] = &[
    "near me", "nearby", "local", "address", "location", "directions", "hours", "map",
    "restaurant", "store", "business", "service area", "city", "town",
];
const TRANSACTIONAL_KEYWORDS: &[&str] = &[
    "buy", "purchase", "order", "booking", "reservation", "hire", "contact", "call",
    "quote", "estimate", "appointment", "schedule", "book now",
];
const NAVIGATIONAL_KEYWORDS: &[&str] = &[
    "website", "homepage", "official site", "main page", "portal", "directory", "login",
    "sign in", "dashboard", "menu", "navigation", "sitemap",
];
const INFORMATIONAL_KEYWORDS: &[&str] = &[
    "what", "why", "how", "when", "where", "definition", "meaning", "explain", "guide",
    "tutorial", "learn", "understand", "compare", "difference", "overview",
];

const INFORMATIONAL_BASELINE: i32 = 20;

fn compile(keywords: &[&str]) -> Vec<Regex> {
    keywords
        .iter()
        .map(|k| Regex::new(&format!(r"(?i)\b{}\b", regex::escape(k))).unwrap())
        .collect()
}

static COMMERCIAL_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(COMMERCIAL_KEYWORDS));
static LOCAL_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(LOCAL_KEYWORDS));
static TRANSACTIONAL_RES: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(TRANSACTIONAL_KEYWORDS));
static NAVIGATIONAL_RES: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(NAVIGATIONAL_KEYWORDS));
static INFORMATIONAL_RES: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(INFORMATIONAL_KEYWORDS));

fn keyword_hits(text: &str, patterns: &[Regex]) -> i32 {
    patterns
        .iter()
        .map(|re| re.find_iter(text).count() as i32)
        .sum()
}

/// Classification output: winning category, confidence, raw scores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentResult {
    pub primary: IntentCategory,
    pub confidence: i32,
    pub scores: [(IntentCategory, i32); 5],
}

/// Score all five categories against the sanitized answer text and the
/// detected feature map.
pub fn classify(text: &str, features: &BTreeMap<String, u32>) -> IntentResult {
    let has = |f: &str| features.contains_key(f);

    let commercial = if has(FEATURE_PRODUCTS) { 25 } else { 0 }
        + if has(FEATURE_TABLE) { 10 } else { 0 }
        + (keyword_hits(text, &COMMERCIAL_RES) * 6).min(40);

    let transactional = if has(FEATURE_PRODUCTS) { 15 } else { 0 }
        + (keyword_hits(text, &TRANSACTIONAL_RES) * 7).min(40);

    let local = if has(FEATURE_LOCAL_BUSINESSES) { 40 } else { 0 }
        + (keyword_hits(text, &LOCAL_RES) * 7).min(40);

    let navigational = if has(FEATURE_NAVIGATION_LIST) { 20 } else { 0 }
        + (keyword_hits(text, &NAVIGATIONAL_RES) * 6).min(30);

    let informational = INFORMATIONAL_BASELINE
        + if has(FEATURE_TEXT) { 10 } else { 0 }
        + (keyword_hits(text, &INFORMATIONAL_RES) * 5).min(30);

    // Tie-break order is the scan order: the first maximum wins.
    let scores = [
        (IntentCategory::Commercial, commercial),
        (IntentCategory::Transactional, transactional),
        (IntentCategory::Local, local),
        (IntentCategory::Navigational, navigational),
        (IntentCategory::Informational, informational),
    ];

    let top = scores.iter().map(|&(_, s)| s).max().unwrap_or(0);
    let primary = scores
        .iter()
        .find(|&&(_, s)| s == top)
        .map(|&(c, _)| c)
        .unwrap_or(IntentCategory::Informational);

    let mut sorted: Vec<i32> = scores.iter().map(|&(_, s)| s).collect();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    let second = sorted.get(1).copied().unwrap_or(0);

    let confidence = if top > 0 {
        ((top - second) * 100) / top
    } else {
        0
    };

    IntentResult {
        primary,
        confidence,
        scores,
    }
}
