/*!
Brand and domain presence matching.

Both operands are NFD-normalized, accent-stripped and quote-normalized
before matching, so "Café" finds "Cafe" and curly-quoted brand names
match their straight-quoted spellings.
*/

use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Match counts for one mention list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionStats {
    /// (original name, occurrence count), input order preserved.
    pub per_name: Vec<(String, u32)>,
    pub total: u32,
    pub any: bool,
}

/// Decompose, drop combining marks, straighten curly quotes.
pub fn normalize_for_match(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201C}' | '\u{201D}' => '"',
            other => other,
        })
        .collect()
}

fn word_boundary_count(haystack: &str, needle: &str) -> u32 {
    let normalized = normalize_for_match(needle);
    let trimmed = normalized.trim();
    if trimmed.is_empty() {
        return 0;
    }
    let pattern = format!(r"(?i)\b{}\b", regex::escape(trimmed));
    match Regex::new(&pattern) {
        Ok(re) => re.find_iter(haystack).count() as u32,
        Err(_) => 0,
    }
}

/// Count brand occurrences in (already sanitized) answer text.
pub fn brand_presence(answer_text: &str, brands: &[String]) -> MentionStats {
    let haystack = normalize_for_match(answer_text);
    let per_name: Vec<(String, u32)> = brands
        .iter()
        .map(|brand| (brand.clone(), word_boundary_count(&haystack, brand)))
        .collect();
    let total = per_name.iter().map(|(_, n)| n).sum();
    MentionStats {
        any: total > 0,
        per_name,
        total,
    }
}

/// Count target-domain occurrences against the citation host list.
pub fn domain_presence(citation_hosts: &[String], domains: &[String]) -> MentionStats {
    let haystack = normalize_for_match(&citation_hosts.join(" "));
    let per_name: Vec<(String, u32)> = domains
        .iter()
        .map(|domain| (domain.clone(), word_boundary_count(&haystack, domain)))
        .collect();
    let total = per_name.iter().map(|(_, n)| n).sum();
    MentionStats {
        any: total > 0,
        per_name,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brands(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn counts_word_boundary_matches_case_insensitively() {
        let stats = brand_presence(
            "Acme leads the market. Many teams pick acme over rivals.",
            &brands(&["Acme"]),
        );
        assert!(stats.any);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.per_name, vec![("Acme".to_string(), 2)]);
    }

    #[test]
    fn substring_inside_word_does_not_match() {
        let stats = brand_presence("Acmeify is unrelated", &brands(&["Acme"]));
        assert!(!stats.any);
        assert_eq!(stats.total, 0);
    }

    #[test]
    fn accents_are_invariant_on_either_operand() {
        let stats = brand_presence("Visit Café Rouge today", &brands(&["Cafe Rouge"]));
        assert!(stats.any);

        let stats = brand_presence("Visit Cafe Rouge today", &brands(&["Café Rouge"]));
        assert!(stats.any);
    }

    #[test]
    fn curly_quotes_are_invariant_on_either_operand() {
        let stats = brand_presence("Everyone loves O\u{2019}Brien tools", &brands(&["O'Brien"]));
        assert!(stats.any);

        let stats = brand_presence("Everyone loves O'Brien tools", &brands(&["O\u{2019}Brien"]));
        assert!(stats.any);
    }

    #[test]
    fn empty_and_blank_brands_never_match() {
        let stats = brand_presence("any text", &brands(&["", "  "]));
        assert!(!stats.any);
        assert_eq!(stats.total, 0);
    }

    #[test]
    fn domain_presence_counts_exact_hosts() {
        let hosts = vec![
            "acme.com".to_string(),
            "reviews.example.org".to_string(),
            "acme.com".to_string(),
        ];
        let stats = domain_presence(&hosts, &brands(&["acme.com"]));
        assert!(stats.any);
        assert_eq!(stats.total, 2);

        let stats = domain_presence(&hosts, &brands(&["cme.com"]));
        assert!(!stats.any);
    }

    #[test]
    fn mention_count_at_least_one_when_present() {
        let stats = brand_presence("Acme twice: Acme", &brands(&["Acme", "Globex"]));
        assert!(stats.any);
        assert!(stats.total >= 1);
        assert_eq!(stats.per_name[1].1, 0);
    }
}
