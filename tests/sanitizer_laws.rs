//! Sanitizer contract checks across a corpus of awkward inputs.

use prompt_runner::sanitize::{sanitize, sanitize_with};

const CORPUS: &[&str] = &[
    "",
    "plain text",
    "Multiple.Sentences!Here?Yes",
    "# Heading\n\nbody",
    "###### Deep heading",
    "**bold** *italic* ***both*** __under__ _single_",
    "[link](https://example.com/path?q=1) trailing",
    "![image](https://example.com/img.png)",
    "```python\nprint('hi')\n```",
    "inline `code` here",
    "* bullet a\n* bullet b\n1. numbered\n2. second\n• dot",
    "<div><p>html</p></div>",
    "&amp; &lt; &gt; &quot; &#39; &nbsp;",
    "&amp;amp;amp;lt;nested",
    "line\\nbreaks\\nliteral",
    "back\\slash \\* escaped",
    "a    lot     of      spaces",
    "blank\n\n\n\n\nlines",
    "  leading and trailing  ",
    "| col a | col b |\n|-------|-------|\n| 1     | 2     |",
    "mixed [l](u) **b** `c` # h\n* i\n<b>t</b> &amp; done",
    "unicode café naïve résumé",
    "\u{201C}curly\u{201D} and \u{2018}single\u{2019}",
    "-5 degrees at 3.5 km",
    "ellipsis...everywhere...Always",
    "1.Tight\n2.Also tight",
    "trailing stars **",
    "URL https://example.com/a?b=c#d inline",
];

#[test]
fn sanitize_is_idempotent_over_the_corpus() {
    for input in CORPUS {
        let once = sanitize(input);
        let twice = sanitize(&once);
        assert_eq!(once, twice, "not idempotent for {input:?}");
    }
}

#[test]
fn sanitize_with_larger_blank_cap_is_idempotent_too() {
    for input in CORPUS {
        let once = sanitize_with(input, 2);
        let twice = sanitize_with(&once, 2);
        assert_eq!(once, twice, "not idempotent (cap 2) for {input:?}");
    }
}

#[test]
fn output_carries_no_markdown_control_characters() {
    for input in CORPUS {
        let out = sanitize(input);
        assert!(!out.contains("```"), "fence survived in {out:?}");
        assert!(!out.contains('`'), "backtick survived in {out:?}");
        assert!(!out.contains("]("), "raw link survived in {out:?}");
        assert!(!out.contains('\\'), "backslash survived in {out:?}");
    }
}

#[test]
fn output_is_trimmed_with_collapsed_whitespace() {
    for input in CORPUS {
        let out = sanitize(input);
        assert_eq!(out, out.trim(), "untrimmed output for {input:?}");
        assert!(!out.contains("  "), "space run survived in {out:?}");
        assert!(!out.contains("\n\n\n"), "blank run survived in {out:?}");
    }
}

#[test]
fn markdown_document_flattens_to_prose() {
    let doc = "# Best CRMs\n\nThe **top** choice is [Acme](https://acme.com/crm).\n\n\
               * Easy setup\n* Fair pricing\n\nSee `docs` for more.";
    let out = sanitize(doc);
    assert_eq!(
        out,
        "Best CRMs\n\nThe top choice is Acme (https://acme.com/crm).\n\n- Easy setup\n- Fair pricing\n\nSee docs for more."
    );
}
