/*!
LLM-scored sentiment and salience.

Both scores run only when a brand matched. Each is one short rubric
completion; the rubric text is part of the score contract, so the
prompts are versioned constants. Failures never fail the record: the
defaults (50 sentiment, 0 salience) stand in.
*/

use std::time::Duration;

use tracing::warn;

use crate::metrics;
use crate::openai::{parse_leading_int, OpenAiClient};
use crate::retry::with_backoff;

pub const DEFAULT_SENTIMENT: i32 = 50;
pub const DEFAULT_SALIENCE: i32 = 0;

const ANALYSIS_SPACER: Duration = Duration::from_millis(300);

// v1 rubrics. Changing either changes the score distribution; bump the
// version and re-baseline before editing.
const SENTIMENT_RUBRIC_V1: &str = "You rate how positively a brand is portrayed in a text. \
Reply with one integer from 0 to 100: 0 means strongly negative, 50 means neutral, \
100 means strongly positive. Reply with the number only.";

const SALIENCE_RUBRIC_V1: &str = "You rate how central a brand is to a text. \
Reply with one integer from 0 to 100: 0 means the brand is absent or incidental, \
100 means the text is primarily about the brand. Reply with the number only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisScores {
    pub sentiment: i32,
    pub salience: i32,
}

impl AnalysisScores {
    pub fn defaults() -> Self {
        Self {
            sentiment: DEFAULT_SENTIMENT,
            salience: DEFAULT_SALIENCE,
        }
    }

    /// Scores for responses with no brand match.
    pub fn absent() -> Self {
        Self {
            sentiment: 0,
            salience: 0,
        }
    }
}

fn clamp_score(raw: Option<i32>, default: i32) -> i32 {
    raw.map(|v| v.clamp(0, 100)).unwrap_or(default)
}

/// Run both analyses sequentially with the configured spacer between
/// them.
pub async fn sentiment_and_salience(
    client: &OpenAiClient,
    model: &str,
    brands: &[String],
    answer_text: &str,
) -> AnalysisScores {
    let brand_list = brands.join(", ");
    let user_prompt = format!("Brand(s): {brand_list}\n\nText:\n{answer_text}");

    let sentiment = match with_backoff("sentiment", || {
        client.completion(model, SENTIMENT_RUBRIC_V1, &user_prompt, 0.1, 3)
    })
    .await
    {
        Ok(reply) => {
            let raw = parse_leading_int(&reply);
            if raw.is_none() {
                metrics::global().enrichment_failures.inc();
            }
            clamp_score(raw, DEFAULT_SENTIMENT)
        }
        Err(e) => {
            warn!(error = %e, "sentiment analysis failed, using default");
            metrics::global().enrichment_failures.inc();
            DEFAULT_SENTIMENT
        }
    };

    tokio::time::sleep(ANALYSIS_SPACER).await;

    let salience = match with_backoff("salience", || {
        client.completion(model, SALIENCE_RUBRIC_V1, &user_prompt, 0.2, 4)
    })
    .await
    {
        Ok(reply) => {
            let raw = parse_leading_int(&reply);
            if raw.is_none() {
                metrics::global().enrichment_failures.inc();
            }
            clamp_score(raw, DEFAULT_SALIENCE)
        }
        Err(e) => {
            warn!(error = %e, "salience analysis failed, using default");
            metrics::global().enrichment_failures.inc();
            DEFAULT_SALIENCE
        }
    };

    AnalysisScores {
        sentiment,
        salience,
    }
}
