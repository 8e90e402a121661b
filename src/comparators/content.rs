use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::embedding::{embedding_similarity, Embedder};
use crate::extract::safe_json_parse;
use crate::llm::TextGenerator;
use crate::prompts;
use crate::TARGET_LLM_REQUEST;

/// Raw contents similarity at or below this adds nothing to the final score.
const CONTENTS_FLOOR: f32 = 0.3;
const CONTENTS_SCALE: f32 = 1.6;
const SECONDARY_WEIGHT: f32 = 0.2;

/// Per-field embedding similarities, each in [0, 1].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub contents: f32,
    pub objectives: f32,
    pub competences: f32,
}

/// Structured narrative produced by the qualitative judge. Key names are
/// pinned by the prompt contract.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QualitativeReport {
    pub similitudes_tecnicas: Vec<String>,
    pub diferencias_sustanciales: Vec<String>,
    pub advertencias: Vec<String>,
    pub explicacion: String,
}

/// Full result of a detailed content comparison.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentAnalysis {
    pub score: f32,
    pub components: ComponentScores,
    pub llm_analysis: QualitativeReport,
    pub explanation: String,
}

/// The four labeled sections of a combined subject text block.
#[derive(Debug, Default, PartialEq)]
pub struct SubjectComponents {
    pub name: String,
    pub competences: String,
    pub objectives: String,
    pub contents: String,
}

/// Splits a combined subject text into its labeled sections. Missing
/// sections default to empty strings.
pub fn extract_components(text: &str) -> SubjectComponents {
    static NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)name:[ \t]*(.*)").unwrap());
    static COMPETENCES: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?is)competences:\s*(\[.*?\])").unwrap());
    static OBJECTIVES: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?is)objectives:\s*(\[.*?\])").unwrap());
    static CONTENTS: Lazy<[Regex; 2]> = Lazy::new(|| {
        [
            Regex::new(r"(?is)contents:\s*(\{.*?\})").unwrap(),
            Regex::new(r"(?is)contents:\s*(\[.*?\])").unwrap(),
        ]
    });

    let mut components = SubjectComponents::default();

    if let Some(capture) = NAME.captures(text) {
        components.name = capture[1].trim().to_string();
    }
    if let Some(capture) = COMPETENCES.captures(text) {
        components.competences = capture[1].to_string();
    }
    if let Some(capture) = OBJECTIVES.captures(text) {
        components.objectives = capture[1].to_string();
    }
    for pattern in CONTENTS.iter() {
        if let Some(capture) = pattern.captures(text) {
            components.contents = capture[1].to_string();
            break;
        }
    }

    components
}

/// Content-dominant composition: contents similarity is rescaled so noise
/// below the floor contributes nothing, while objectives and competences
/// contribute at most 0.2 each.
pub fn compute_final_score(scores: &ComponentScores) -> f32 {
    let contents_sim = ((scores.contents - CONTENTS_FLOOR) * CONTENTS_SCALE).max(0.0);
    let objectives_sim = scores.objectives * SECONDARY_WEIGHT;
    let competences_sim = scores.competences * SECONDARY_WEIGHT;
    (contents_sim + objectives_sim + competences_sim).min(1.0)
}

fn coerce_string_list(value: &Value, key: &str) -> Result<Vec<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| anyhow!("Invalid JSON structure: {} is not a list", key))?;
    Ok(items
        .iter()
        .map(|item| match item {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect())
}

/// Validates a raw judge response into a report, splitting any difference
/// expressed as "A vs. B" into two atomic statements.
pub fn parse_qualitative_report(response: &str) -> Result<QualitativeReport> {
    let parsed = safe_json_parse(response)?;
    let object = parsed
        .as_object()
        .ok_or_else(|| anyhow!("LLM response is not an object"))?;

    let required = [
        "similitudes_tecnicas",
        "diferencias_sustanciales",
        "advertencias",
        "explicacion",
    ];
    let missing: Vec<&str> = required
        .iter()
        .filter(|key| !object.contains_key(**key))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(anyhow!("JSON response missing required keys: {:?}", missing));
    }

    let similitudes = coerce_string_list(&object["similitudes_tecnicas"], "similitudes_tecnicas")?;
    let diferencias =
        coerce_string_list(&object["diferencias_sustanciales"], "diferencias_sustanciales")?;
    let advertencias = coerce_string_list(&object["advertencias"], "advertencias")?;
    let explicacion = object["explicacion"]
        .as_str()
        .ok_or_else(|| anyhow!("Invalid JSON structure: explicacion is not a string"))?
        .to_string();

    let diferencias = diferencias
        .into_iter()
        .flat_map(|item| {
            if item.contains(" vs. ") {
                item.split(" vs. ")
                    .map(|side| side.trim().to_string())
                    .collect::<Vec<_>>()
            } else {
                vec![item]
            }
        })
        .collect();

    Ok(QualitativeReport {
        similitudes_tecnicas: similitudes,
        diferencias_sustanciales: diferencias,
        advertencias,
        explicacion,
    })
}

fn fallback_report(error: &str) -> QualitativeReport {
    QualitativeReport {
        similitudes_tecnicas: Vec::new(),
        diferencias_sustanciales: Vec::new(),
        advertencias: vec![format!("Qualitative analysis failed: {}", error)],
        explicacion: format!("No explanation could be generated due to an error: {}", error),
    }
}

/// Asks the judge for a structured narrative about the two subjects.
/// Degrades to a fallback report on any failure, never raises.
async fn qualitative_analysis(
    llm: &dyn TextGenerator,
    comp1: &SubjectComponents,
    comp2: &SubjectComponents,
    final_score: f32,
) -> QualitativeReport {
    let prompt = prompts::subject_expert_prompt(
        &comp1.name,
        &comp1.competences,
        &comp1.objectives,
        &comp1.contents,
        &comp2.name,
        &comp2.competences,
        &comp2.objectives,
        &comp2.contents,
        final_score,
    );

    let response = match llm.generate(&prompt).await {
        Ok(response) => response,
        Err(e) => {
            warn!(target: TARGET_LLM_REQUEST, "Qualitative analysis request failed: {}", e);
            return fallback_report(&e.to_string());
        }
    };

    let mut response = response.trim().to_string();
    if !response.ends_with('}') {
        debug!(target: TARGET_LLM_REQUEST, "Incomplete response: appending missing closing brace");
        response.push('}');
    }

    match parse_qualitative_report(&response) {
        Ok(report) => report,
        Err(e) => {
            warn!(target: TARGET_LLM_REQUEST, "Failed to parse qualitative analysis: {}", e);
            fallback_report(&e.to_string())
        }
    }
}

/// Detailed content comparison of two combined subject texts.
///
/// The three per-field embedding similarities run concurrently; completion
/// order is irrelevant. The caller multiplies `score` by 100 for the stored
/// percentage value.
pub async fn similarity_score(
    embedder: &dyn Embedder,
    llm: &dyn TextGenerator,
    text1: &str,
    text2: &str,
) -> ContentAnalysis {
    let comp1 = extract_components(text1);
    let comp2 = extract_components(text2);
    debug!("Extracted components for '{}' and '{}'", comp1.name, comp2.name);

    let (contents, objectives, competences) = tokio::join!(
        embedding_similarity(embedder, &comp1.contents, &comp2.contents, true),
        embedding_similarity(embedder, &comp1.objectives, &comp2.objectives, true),
        embedding_similarity(embedder, &comp1.competences, &comp2.competences, true),
    );

    let components = ComponentScores {
        contents,
        objectives,
        competences,
    };
    let final_score = compute_final_score(&components);
    info!("Content similarity components: {:?}, final: {:.4}", components, final_score);

    let llm_analysis = qualitative_analysis(llm, &comp1, &comp2, final_score).await;
    let explanation = if llm_analysis.explicacion.is_empty() {
        "No detailed explanation was provided.".to_string()
    } else {
        llm_analysis.explicacion.clone()
    };

    ContentAnalysis {
        score: (final_score * 10000.0).round() / 10000.0,
        components,
        llm_analysis,
        explanation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(anyhow!("provider unavailable"))
        }
    }

    struct FixedJudge(&'static str);

    #[async_trait]
    impl TextGenerator for FixedJudge {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    const VALID_REPORT: &str = r#"{
        "similitudes_tecnicas": ["Both cover sorting"],
        "diferencias_sustanciales": ["Graphs only in subject 1"],
        "advertencias": [],
        "explicacion": "Both subjects teach core algorithmics."
    }"#;

    #[test]
    fn extracts_all_labeled_sections() {
        let text = "Name: Algorithms\nCompetences: [\"Analyze complexity\"]\nObjectives: [\"Implement sorts\"]\nContents: {\"Sorting\": [\"Quicksort\"]}";
        let components = extract_components(text);
        assert_eq!(components.name, "Algorithms");
        assert_eq!(components.competences, "[\"Analyze complexity\"]");
        assert_eq!(components.objectives, "[\"Implement sorts\"]");
        assert_eq!(components.contents, "{\"Sorting\": [\"Quicksort\"]}");
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let components = extract_components("Name: Physics");
        assert_eq!(components.name, "Physics");
        assert_eq!(components.competences, "");
        assert_eq!(components.contents, "");
    }

    #[test]
    fn contents_accepts_list_form() {
        let components = extract_components("Contents: [\"Electrostatics\", \"Currents\"]");
        assert_eq!(components.contents, "[\"Electrostatics\", \"Currents\"]");
    }

    #[test]
    fn contents_at_floor_contributes_nothing() {
        let scores = ComponentScores {
            contents: 0.3,
            objectives: 1.0,
            competences: 1.0,
        };
        let score = compute_final_score(&scores);
        assert!((score - 0.4).abs() < 1e-6);
    }

    #[test]
    fn contents_saturates_the_scale() {
        let scores = ComponentScores {
            contents: 0.925,
            objectives: 0.0,
            competences: 0.0,
        };
        assert!((compute_final_score(&scores) - 1.0).abs() < 1e-6);
        let scores = ComponentScores {
            contents: 1.0,
            objectives: 1.0,
            competences: 1.0,
        };
        assert_eq!(compute_final_score(&scores), 1.0);
    }

    #[test]
    fn composition_is_content_dominant() {
        let scores = ComponentScores {
            contents: 0.6,
            objectives: 0.5,
            competences: 0.5,
        };
        // (0.6 - 0.3) * 1.6 + 0.1 + 0.1
        assert!((compute_final_score(&scores) - 0.68).abs() < 1e-6);
    }

    #[test]
    fn parses_valid_report() {
        let report = parse_qualitative_report(VALID_REPORT).unwrap();
        assert_eq!(report.similitudes_tecnicas, vec!["Both cover sorting"]);
        assert_eq!(report.explicacion, "Both subjects teach core algorithmics.");
    }

    #[test]
    fn splits_vs_differences_into_atomic_statements() {
        let response = r#"{
            "similitudes_tecnicas": [],
            "diferencias_sustanciales": ["Analog circuits vs. Digital circuits", "Plain item"],
            "advertencias": [],
            "explicacion": "ok"
        }"#;
        let report = parse_qualitative_report(response).unwrap();
        assert_eq!(
            report.diferencias_sustanciales,
            vec!["Analog circuits", "Digital circuits", "Plain item"]
        );
    }

    #[test]
    fn rejects_missing_keys() {
        let response = r#"{"similitudes_tecnicas": [], "explicacion": "ok"}"#;
        assert!(parse_qualitative_report(response).is_err());
    }

    #[test]
    fn rejects_wrong_types() {
        let response = r#"{
            "similitudes_tecnicas": "not a list",
            "diferencias_sustanciales": [],
            "advertencias": [],
            "explicacion": "ok"
        }"#;
        assert!(parse_qualitative_report(response).is_err());
    }

    #[test]
    fn coerces_non_string_list_items() {
        let response = r#"{
            "similitudes_tecnicas": [42],
            "diferencias_sustanciales": [],
            "advertencias": [],
            "explicacion": "ok"
        }"#;
        let report = parse_qualitative_report(response).unwrap();
        assert_eq!(report.similitudes_tecnicas, vec!["42"]);
    }

    #[tokio::test]
    async fn provider_failure_yields_zero_components_and_fallback_report() {
        let text = "Name: X\nCompetences: [\"a\"]\nObjectives: [\"b\"]\nContents: [\"c\"]";
        let analysis =
            similarity_score(&FailingEmbedder, &FixedJudge("garbage"), text, text).await;
        assert_eq!(analysis.score, 0.0);
        assert_eq!(analysis.components, ComponentScores::default());
        assert!(analysis.llm_analysis.similitudes_tecnicas.is_empty());
        assert!(!analysis.llm_analysis.advertencias.is_empty());
        assert!(analysis.explanation.contains("No explanation could be generated"));
    }

    #[tokio::test]
    async fn truncated_judge_response_is_repaired() {
        let truncated = r#"{
            "similitudes_tecnicas": [],
            "diferencias_sustanciales": [],
            "advertencias": [],
            "explicacion": "fine""#;
        let text = "Name: X\nCompetences: [\"a\"]\nObjectives: [\"a\"]\nContents: [\"a\"]";
        let analysis =
            similarity_score(&FailingEmbedder, &FixedJudge(truncated), text, text).await;
        assert_eq!(analysis.llm_analysis.explicacion, "fine");
        assert_eq!(analysis.explanation, "fine");
    }
}
