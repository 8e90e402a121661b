use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::embedding::{embedding_similarity, Embedder};
use crate::extract::SubjectTheme;
use crate::fuzzy::sequence_ratio;
use crate::llm::TextGenerator;
use crate::prompts;
use crate::TARGET_LLM_REQUEST;

/// Sentinel produced by theme extraction when a field could not be
/// determined; absence must not be rewarded with embedding noise.
const UNKNOWN: &str = "Unknown";

const EMBEDDING_WEIGHT: f32 = 0.45;
const LLM_WEIGHT: f32 = 0.45;
const TITLE_WEIGHT: f32 = 0.10;

/// Compares two course themes into a single bounded score in [0, 1].
///
/// Combines per-field embedding similarity, an LLM numeric judgment, and a
/// fuzzy title ratio. Exact field matches floor the result because embedding
/// noise can understate obviously-identical topics.
pub async fn compare_themes(
    embedder: &dyn Embedder,
    llm: &dyn TextGenerator,
    theme1: &SubjectTheme,
    theme2: &SubjectTheme,
    name1: &str,
    name2: &str,
) -> f32 {
    if theme1.is_empty() || theme2.is_empty() {
        return 0.0;
    }
    if theme1 == theme2 {
        return 1.0;
    }

    let fields = [
        (&theme1.core_topic, &theme2.core_topic, 0.4),
        (&theme1.key_contents, &theme2.key_contents, 0.4),
        (&theme1.application_domain, &theme2.application_domain, 0.2),
    ];

    let mut weighted_score = 0.0;
    for (text1, text2, weight) in fields {
        let similarity = if text1 == UNKNOWN || text2 == UNKNOWN {
            0.0
        } else {
            embedding_similarity(embedder, text1, text2, false).await
        };
        weighted_score += weight * similarity;
    }

    let title_similarity = if name1.is_empty() || name2.is_empty() {
        0.0
    } else {
        sequence_ratio(&name1.to_lowercase(), &name2.to_lowercase()) as f32
    };
    debug!(
        "Title similarity between '{}' and '{}': {:.2}",
        name1, name2, title_similarity
    );

    let llm_score = judge_theme_score(llm, theme1, theme2).await;

    let mut final_score =
        EMBEDDING_WEIGHT * weighted_score + LLM_WEIGHT * llm_score + TITLE_WEIGHT * title_similarity;

    if theme1.core_topic == theme2.core_topic && theme1.key_contents == theme2.key_contents {
        final_score = final_score.max(0.90);
    } else if theme1.core_topic == theme2.core_topic {
        final_score = final_score.max(0.80);
    }

    let final_score = (final_score.clamp(0.0, 1.0) * 100.0).round() / 100.0;
    info!(
        "Theme comparison - Embedding: {:.2}, LLM: {:.2}, Title: {:.2}, Final: {:.2}",
        weighted_score, llm_score, title_similarity, final_score
    );
    final_score
}

/// Asks the judge for a numeric theme score and parses the first two-decimal
/// float literal out of the raw response. Degrades to 0.0, never fails.
async fn judge_theme_score(
    llm: &dyn TextGenerator,
    theme1: &SubjectTheme,
    theme2: &SubjectTheme,
) -> f32 {
    static SCORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"0?\.\d{1,2}").unwrap());

    let prompt = prompts::theme_comparator_prompt(theme1, theme2);
    match llm.generate(&prompt).await {
        Ok(response) => {
            let response = response.trim();
            debug!(target: TARGET_LLM_REQUEST, "Raw LLM response for theme comparison: {}", response);
            match SCORE
                .find(response)
                .and_then(|m| m.as_str().parse::<f32>().ok())
            {
                Some(score) => score,
                None => {
                    warn!(target: TARGET_LLM_REQUEST, "No numeric score found in LLM response: {}", response);
                    0.0
                }
            }
        }
        Err(e) => {
            warn!(target: TARGET_LLM_REQUEST, "Error in LLM theme comparison: {}", e);
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(anyhow!("provider unavailable"))
        }
    }

    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            // Identical text maps to identical vectors; otherwise orthogonal.
            if text.contains("Sorting") {
                Ok(vec![1.0, 0.0])
            } else {
                Ok(vec![0.0, 1.0])
            }
        }
    }

    struct FixedJudge(&'static str);

    #[async_trait]
    impl TextGenerator for FixedJudge {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingJudge;

    #[async_trait]
    impl TextGenerator for FailingJudge {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Err(anyhow!("model offline"))
        }
    }

    fn theme(core: &str, contents: &str, domain: &str) -> SubjectTheme {
        SubjectTheme {
            core_topic: core.to_string(),
            key_contents: contents.to_string(),
            application_domain: domain.to_string(),
        }
    }

    #[tokio::test]
    async fn identical_themes_short_circuit_to_one() {
        let t = theme("Algorithms", "Sorting, Searching", "CS");
        // Providers fail outright to prove the short-circuit never calls them.
        let score =
            compare_themes(&FailingEmbedder, &FailingJudge, &t, &t, "Algo", "Algo").await;
        assert_eq!(score, 1.0);
    }

    #[tokio::test]
    async fn empty_theme_scores_zero() {
        let empty = theme("", "", "");
        let full = theme("Physics", "Mechanics", "Engineering");
        let score =
            compare_themes(&FailingEmbedder, &FailingJudge, &empty, &full, "a", "b").await;
        assert_eq!(score, 0.0);
    }

    #[tokio::test]
    async fn equal_topic_and_contents_floor_at_090() {
        let t1 = theme("Algorithms", "Sorting", "CS");
        let t2 = theme("Algorithms", "Sorting", "Math");
        let score =
            compare_themes(&FailingEmbedder, &FixedJudge("0.10"), &t1, &t2, "x", "y").await;
        assert!(score >= 0.90);
    }

    #[tokio::test]
    async fn equal_topic_only_floors_at_080() {
        let t1 = theme("Algorithms", "Sorting", "CS");
        let t2 = theme("Algorithms", "Graphs", "CS");
        let score =
            compare_themes(&FailingEmbedder, &FixedJudge("0.10"), &t1, &t2, "x", "y").await;
        assert!((0.80..0.90).contains(&score));
    }

    #[tokio::test]
    async fn unknown_sentinel_contributes_nothing() {
        let t1 = theme("Unknown", "Sorting", "CS");
        let t2 = theme("Physics", "Sorting", "CS");
        let score =
            compare_themes(&AxisEmbedder, &FixedJudge("no score here"), &t1, &t2, "", "").await;
        // core_topic is forced to 0.0 by the sentinel; key_contents and
        // application_domain embed identically: 0.45 * (0.4 + 0.2) = 0.27.
        assert!((score - 0.27).abs() < 1e-6);
    }

    #[tokio::test]
    async fn judge_score_is_parsed_from_free_text() {
        let t1 = theme("Databases", "SQL", "IT");
        let t2 = theme("Networks", "TCP", "IT");
        let score = compare_themes(
            &FailingEmbedder,
            &FixedJudge("The similarity is 0.75 overall"),
            &t1,
            &t2,
            "a",
            "b",
        )
        .await;
        // 0.45 * 0.75 rounded to 2 decimals; title ratio of "a"/"b" is 0.
        assert!((score - 0.34).abs() < 1e-6);
    }

    #[tokio::test]
    async fn judge_failure_degrades_to_zero_component() {
        let t1 = theme("Databases", "SQL", "IT");
        let t2 = theme("Networks", "TCP", "IT");
        let score =
            compare_themes(&FailingEmbedder, &FailingJudge, &t1, &t2, "a", "b").await;
        assert_eq!(score, 0.0);
    }

    #[tokio::test]
    async fn score_stays_in_bounds() {
        let t1 = theme("Algorithms", "Sorting", "CS");
        let t2 = theme("Algorithms", "Sorting & Searching", "CS");
        let score = compare_themes(
            &AxisEmbedder,
            &FixedJudge("0.99"),
            &t1,
            &t2,
            "Algorithms",
            "Algorithms",
        )
        .await;
        assert!((0.0..=1.0).contains(&score));
    }
}
