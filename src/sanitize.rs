/*!
Response Sanitizer

Turns raw markdown/HTML answer text into normalized prose. The whole
pipeline is idempotent: sanitize(sanitize(x)) == sanitize(x).
*/

use std::sync::LazyLock;

use regex::Regex;

static MD_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\(([^)]*)\)").unwrap());
static CODE_FENCE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*```[a-zA-Z0-9_+-]*\s*$").unwrap());
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(?:#{1,6}[ \t]+)+").unwrap());
static BOLD_ITALIC_STARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*{1,3}([^*\n]+)\*{1,3}").unwrap());
static BOLD_ITALIC_UNDERSCORES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_{1,3}([^_\n]+)_{1,3}").unwrap());
static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^<>]+>").unwrap());
// Sentence boundary: punctuation glued to a capitalized continuation.
// Deliberately narrow so URLs and decimals survive.
static SENTENCE_GAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([.?!;:])([A-Z])").unwrap());
static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(?:[*•][ \t]*|-[ \t]+|\d+\.[ \t]+)").unwrap());
static SPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());

const DEFAULT_MAX_BLANK_LINES: usize = 1;

/// Sanitize with the default blank-line cap.
pub fn sanitize(input: &str) -> String {
    sanitize_with(input, DEFAULT_MAX_BLANK_LINES)
}

/// Full pipeline. `max_blank_lines` bounds consecutive empty lines in
/// the output.
pub fn sanitize_with(input: &str, max_blank_lines: usize) -> String {
    let text = unescape_newlines(input);
    let text = rewrite_links(&text);
    let text = strip_code_markers(&text);
    let text = strip_headings(&text);
    let text = strip_emphasis(&text);
    let text = strip_backslashes(&text);
    let text = strip_html(&text);
    let text = decode_entities(&text);
    // Decoding can surface fresh angle brackets; strip again so a second
    // sanitize pass sees nothing new.
    let text = strip_html(&text);
    let text = space_after_punctuation(&text);
    let text = normalize_bullets(&text);
    collapse_whitespace(&text, max_blank_lines)
}

fn unescape_newlines(text: &str) -> String {
    text.replace("\\n", "\n")
}

fn rewrite_links(text: &str) -> String {
    MD_LINK
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let label = caps[1].trim();
            let url = caps[2].trim();
            if url.is_empty() {
                label.to_string()
            } else if label.is_empty() {
                url.to_string()
            } else {
                format!("{label} ({url})")
            }
        })
        .into_owned()
}

fn strip_code_markers(text: &str) -> String {
    let text = CODE_FENCE_LINE.replace_all(text, "");
    text.replace('`', "")
}

fn strip_headings(text: &str) -> String {
    HEADING.replace_all(text, "").into_owned()
}

fn strip_emphasis(text: &str) -> String {
    let text = BOLD_ITALIC_STARS.replace_all(text, "$1");
    BOLD_ITALIC_UNDERSCORES.replace_all(&text, "$1").into_owned()
}

fn strip_backslashes(text: &str) -> String {
    text.replace('\\', "")
}

fn strip_html(text: &str) -> String {
    HTML_TAG.replace_all(text, "").into_owned()
}

fn decode_entities(text: &str) -> String {
    // Every replacement shrinks the text, so the fixpoint loop
    // terminates. Doubly-encoded entities fully decode in one sanitize
    // pass, which keeps the pipeline idempotent.
    let mut current = text.to_string();
    loop {
        let next = decode_entities_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn decode_entities_once(text: &str) -> String {
    let mut out = text.to_string();
    for (entity, replacement) in [
        ("&nbsp;", " "),
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&apos;", "'"),
        ("&#39;", "'"),
        ("&#34;", "\""),
        ("&ndash;", "-"),
        ("&mdash;", "-"),
        ("&hellip;", "..."),
        // Must come last so it cannot manufacture entities consumed above
        ("&amp;", "&"),
    ] {
        out = out.replace(entity, replacement);
    }
    out
}

fn space_after_punctuation(text: &str) -> String {
    SENTENCE_GAP.replace_all(text, "$1 $2").into_owned()
}

fn normalize_bullets(text: &str) -> String {
    BULLET.replace_all(text, "- ").into_owned()
}

fn collapse_whitespace(text: &str, max_blank_lines: usize) -> String {
    let collapsed = SPACE_RUN.replace_all(text, " ");

    let mut out: Vec<&str> = Vec::new();
    let mut blank_run = 0usize;
    for line in collapsed.lines().map(str::trim) {
        if line.is_empty() {
            blank_run += 1;
            if blank_run <= max_blank_lines {
                out.push(line);
            }
        } else {
            blank_run = 0;
            out.push(line);
        }
    }

    out.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_idempotent(input: &str) {
        let once = sanitize(input);
        let twice = sanitize(&once);
        assert_eq!(once, twice, "sanitize not idempotent for {input:?}");
    }

    #[test]
    fn unescapes_literal_newlines() {
        assert_eq!(sanitize("first\\nsecond"), "first\nsecond");
    }

    #[test]
    fn rewrites_markdown_links() {
        assert_eq!(
            sanitize("see [the docs](https://example.com/a) for more"),
            "see the docs (https://example.com/a) for more"
        );
    }

    #[test]
    fn bare_label_or_url_links_collapse() {
        assert_eq!(sanitize("[only label]()"), "only label");
        assert_eq!(sanitize("[](https://example.com)"), "https://example.com");
    }

    #[test]
    fn strips_code_fences_keeping_content() {
        let input = "before\n```rust\nlet x = 1;\n```\nafter";
        let out = sanitize(input);
        assert!(out.contains("let x = 1;"));
        assert!(!out.contains("```"));
    }

    #[test]
    fn strips_headings_and_emphasis() {
        assert_eq!(sanitize("## Top **Brands**"), "Top Brands");
        assert_eq!(sanitize("*italic* and __bold__"), "italic and bold");
    }

    #[test]
    fn normalizes_bullets() {
        let out = sanitize("* one\n• two\n- three\n1. four");
        assert_eq!(out, "- one\n- two\n- three\n- four");
    }

    #[test]
    fn strips_html_and_decodes_entities() {
        assert_eq!(sanitize("<b>bold</b> &amp; <i>quiet</i>"), "bold & quiet");
        assert_eq!(sanitize("a &lt;tag&gt; b"), "a b");
    }

    #[test]
    fn ensures_space_after_sentence_punctuation() {
        assert_eq!(sanitize("First.Second!Third"), "First. Second! Third");
    }

    #[test]
    fn urls_and_decimals_survive_sentence_spacing() {
        assert_eq!(
            sanitize("rated 4.5 stars, see example.com/reviews"),
            "rated 4.5 stars, see example.com/reviews"
        );
    }

    #[test]
    fn collapses_whitespace_runs() {
        assert_eq!(sanitize("a   b\n\n\n\nc"), "a b\n\nc");
    }

    #[test]
    fn idempotent_on_plain_text() {
        assert_idempotent("A simple answer about Acme.");
    }

    #[test]
    fn idempotent_on_rich_markdown() {
        assert_idempotent(
            "# Title\n\nSome **bold** text with [a link](https://example.com).\\n\nMore.\n\n* item one\n* item two\n\n```\ncode here\n```\n<p>html&nbsp;para</p>",
        );
    }

    #[test]
    fn idempotent_on_adversarial_fragments() {
        for input in [
            "&amp;lt;b&amp;gt;doubly encoded",
            "&amp;amp;amp;lt;deeply encoded",
            "\\\\n escaped backslash n",
            "1.Tight numbered item",
            "***deep* emphasis**",
            "trailing stars ab*",
            "# # double heading",
            "ellipsis...Everywhere",
            "a_b_c_d snake case",
            "-5 degrees is not a bullet",
            "a < b and c > d",
        ] {
            assert_idempotent(input);
        }
    }

    #[test]
    fn negative_number_is_not_a_bullet() {
        assert_eq!(sanitize("-5 degrees"), "-5 degrees");
    }
}
