use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use readability::extractor;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use url::Url;

use crate::llm::TextGenerator;
use crate::prompts;
use crate::TARGET_WEB_REQUEST;

const FETCH_TIMEOUT_SECS: u64 = 30;
const SCRAPE_TIMEOUT_SECS: u64 = 60;
const THEME_MAX_RETRIES: usize = 3;
/// Contents maps are capped so one sprawling syllabus cannot dominate the
/// embedding input.
const MAX_CONTENT_TOPICS: usize = 8;

/// Coarse-grained course summary used for cheap candidate filtering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubjectTheme {
    pub core_topic: String,
    pub key_contents: String,
    pub application_domain: String,
}

impl SubjectTheme {
    pub fn is_empty(&self) -> bool {
        self.core_topic.trim().is_empty()
            && self.key_contents.trim().is_empty()
            && self.application_domain.trim().is_empty()
    }

    /// Default theme when extraction exhausts its retries.
    pub fn fallback(subject_title: Option<&str>) -> Self {
        let title = subject_title.unwrap_or("Unknown");
        Self {
            core_topic: title.to_string(),
            key_contents: format!("Extracted from title: {}", title),
            application_domain: "General Education".to_string(),
        }
    }
}

/// Structured subject fields normalized into string form for embedding.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubjectFields {
    pub competences: String,
    pub objectives: String,
    pub contents: String,
}

impl SubjectFields {
    /// Labeled text block consumed by the content comparator.
    pub fn combined_text(&self, name: &str) -> String {
        format!(
            "Name: {}\nCompetences: {}\nObjectives: {}\nContents: {}",
            name, self.competences, self.objectives, self.contents
        )
    }
}

/// A candidate subject link discovered on a degree guide page.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateLink {
    pub name: String,
    pub url: String,
}

/// Parses possibly-messy LLM output into JSON: strips markdown fences, trims
/// to the outermost object, and appends missing closing braces.
pub fn safe_json_parse(text: &str) -> Result<Value> {
    let mut cleaned = text.trim().to_string();

    if let Ok(value) = serde_json::from_str(&cleaned) {
        return Ok(value);
    }

    if cleaned.starts_with("```") {
        cleaned = cleaned
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
    }

    if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if start < end {
            cleaned = cleaned[start..=end].to_string();
        }
    }

    let opens = cleaned.matches('{').count();
    let closes = cleaned.matches('}').count();
    if opens > closes {
        cleaned.push_str(&"}".repeat(opens - closes));
    }

    serde_json::from_str(&cleaned).with_context(|| {
        let preview: String = text.chars().take(200).collect();
        format!("Unrecoverable JSON: {}", preview)
    })
}

/// Fetches a page body over HTTP with a bounded timeout.
pub async fn fetch_page(url: &str) -> Result<String> {
    info!(target: TARGET_WEB_REQUEST, "Fetching {}", url);
    let response = timeout(Duration::from_secs(FETCH_TIMEOUT_SECS), reqwest::get(url))
        .await
        .map_err(|_| anyhow!("Request to {} timed out", url))?
        .with_context(|| format!("Failed to fetch {}", url))?;

    if !response.status().is_success() {
        return Err(anyhow!(
            "Request to {} failed with status {}",
            url,
            response.status()
        ));
    }

    response
        .text()
        .await
        .with_context(|| format!("Failed to read body from {}", url))
}

/// Extracts the readable syllabus text of a subject page.
///
/// The scrape itself is blocking, so it runs on the blocking pool; the
/// timeout then applies to the whole fetch and a slow page never pins a
/// runtime worker.
pub async fn extract_subject_text(url: &str, title: &str) -> Result<String> {
    info!(target: TARGET_WEB_REQUEST, "Requesting extraction for URL: {}", url);

    let scrape_url = url.to_string();
    let scrape_task = tokio::task::spawn_blocking(move || extractor::scrape(&scrape_url));

    match timeout(Duration::from_secs(SCRAPE_TIMEOUT_SECS), scrape_task).await {
        Ok(Ok(Ok(product))) => {
            if product.text.is_empty() {
                warn!(target: TARGET_WEB_REQUEST, "Extracted page is empty for URL: {}", url);
                return Ok(String::new());
            }
            Ok(format!("Title: {}\nBody: {}\n", title, product.text))
        }
        Ok(Ok(Err(e))) => Err(anyhow!("Error extracting page {}: {:?}", url, e)),
        Ok(Err(e)) => Err(anyhow!("Extraction task failed for {}: {}", url, e)),
        Err(_) => Err(anyhow!("Extraction timed out for {}", url)),
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Keeps at most `MAX_CONTENT_TOPICS` non-empty topics from a contents map.
fn cap_contents(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let capped: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(_, v)| match v {
                    Value::Array(items) => !items.is_empty(),
                    Value::String(s) => !s.is_empty(),
                    Value::Null => false,
                    _ => true,
                })
                .take(MAX_CONTENT_TOPICS)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(capped)
        }
        other => other.clone(),
    }
}

/// Extracts structured fields for every subject the model found in the text,
/// keyed by subject title. Fails when the model output cannot be interpreted.
pub async fn extract_subject_fields(
    llm: &dyn TextGenerator,
    raw_text: &str,
    title: &str,
) -> Result<BTreeMap<String, SubjectFields>> {
    let prompt = prompts::extract_subject_prompt(title, raw_text);
    let response = llm
        .generate(&prompt)
        .await
        .context("Structured extraction failed")?;

    let parsed = safe_json_parse(response.trim())?;
    let subjects = parsed
        .as_object()
        .ok_or_else(|| anyhow!("LLM response is not an object"))?;

    let mut result = BTreeMap::new();
    for (name, data) in subjects {
        let fields = SubjectFields {
            competences: value_to_text(data.get("competences").unwrap_or(&Value::Null)),
            objectives: value_to_text(data.get("objectives").unwrap_or(&Value::Null)),
            contents: value_to_text(&cap_contents(
                data.get("contents").unwrap_or(&Value::Null),
            )),
        };
        result.insert(name.clone(), fields);
    }

    if result.is_empty() {
        return Err(anyhow!("No subjects found in LLM response"));
    }
    Ok(result)
}

/// Extracts the theme of a subject, retrying on malformed model output and
/// falling back to a title-derived default. Never fails.
pub async fn extract_theme(
    llm: &dyn TextGenerator,
    raw_text: &str,
    subject_title: Option<&str>,
) -> SubjectTheme {
    let prompt = prompts::extract_theme_prompt(raw_text);

    for attempt in 0..THEME_MAX_RETRIES {
        let parsed = match llm.generate(&prompt).await {
            Ok(response) => safe_json_parse(response.trim()),
            Err(e) => Err(e),
        };

        match parsed {
            Ok(theme) if theme.get("core_topic").is_some() => {
                let core_topic = value_to_text(theme.get("core_topic").unwrap_or(&Value::Null));
                let key_contents = match theme.get("key_contents") {
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(value_to_text)
                        .collect::<Vec<_>>()
                        .join(", "),
                    Some(other) => value_to_text(other),
                    None => String::new(),
                };
                let application_domain =
                    value_to_text(theme.get("application_domain").unwrap_or(&Value::Null));

                return SubjectTheme {
                    core_topic: if core_topic.trim().is_empty() {
                        subject_title.unwrap_or("Unknown").to_string()
                    } else {
                        core_topic.trim().to_string()
                    },
                    key_contents,
                    application_domain: if application_domain.trim().is_empty() {
                        "General Education".to_string()
                    } else {
                        application_domain.trim().to_string()
                    },
                };
            }
            Ok(_) => {
                warn!("Theme response missing required fields on attempt {}", attempt + 1);
            }
            Err(e) => {
                warn!("Theme extraction failed on attempt {}: {}", attempt + 1, e);
            }
        }
    }

    debug!("Falling back to title-derived theme for {:?}", subject_title);
    SubjectTheme::fallback(subject_title)
}

/// Recognizes syllabus-description URLs across the supported universities.
pub fn is_subject_url(url: &str) -> bool {
    static PATH_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
        vec![
            Regex::new(r"/(asignaturas|assignatures|syllabus)/[A-Z0-9]+$").unwrap(),
            Regex::new(r"guiadocent\.udl\.cat/.*/\d{4}-\d{2}_\d+$").unwrap(),
        ]
    });

    let url_lower = url.to_lowercase();
    let query_match = url_lower.contains("asignatura=")
        || url_lower.contains("assignatura=")
        || url_lower.contains("subject=")
        || url_lower.contains("ficha=")
        || ["ficha_asignatura", "subject_description", "asignatura_detalle"]
            .iter()
            .any(|kw| url_lower.contains(kw));

    query_match
        || (url_lower.contains("cvut.cz") && url_lower.contains("predmet"))
        || PATH_PATTERNS.iter().any(|re| re.is_match(url))
}

/// Pulls candidate subject links out of raw guide-page HTML.
fn candidate_links_from_html(base_url: &str, html: &str, max: usize) -> Result<Vec<CandidateLink>> {
    static ANCHOR: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"(?is)<a\s[^>]*href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#).unwrap()
    });
    static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

    let base = Url::parse(base_url).with_context(|| format!("Invalid guide URL: {}", base_url))?;
    let mut seen = std::collections::BTreeSet::new();
    let mut links = Vec::new();

    for capture in ANCHOR.captures_iter(html) {
        let href = capture[1].trim();
        if href.is_empty() {
            continue;
        }

        let full_url = match base.join(href) {
            Ok(resolved) => resolved.to_string(),
            Err(_) => continue,
        };

        if !seen.insert(full_url.clone()) || !is_subject_url(&full_url) {
            continue;
        }

        let stripped = TAGS.replace_all(&capture[2], " ");
        let name = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
        links.push(CandidateLink {
            name: if name.is_empty() {
                "Unknown Subject".to_string()
            } else {
                name
            },
            url: full_url,
        });

        if max > 0 && links.len() >= max {
            break;
        }
    }

    Ok(links)
}

/// Extracts up to `max` candidate subjects from a degree guide page.
pub async fn extract_candidates(guide_url: &str, max: usize) -> Result<Vec<CandidateLink>> {
    let html = fetch_page(guide_url).await?;
    let links = candidate_links_from_html(guide_url, &html, max)?;
    info!(target: TARGET_WEB_REQUEST, "Found {} candidate subjects in {}", links.len(), guide_url);
    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct ScriptedGenerator {
        responses: Vec<String>,
        calls: std::sync::Mutex<usize>,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: responses.into_iter().map(String::from).collect(),
                calls: std::sync::Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            let mut calls = self.calls.lock().unwrap();
            let response = self
                .responses
                .get(*calls)
                .cloned()
                .unwrap_or_else(|| self.responses.last().cloned().unwrap_or_default());
            *calls += 1;
            Ok(response)
        }
    }

    #[test]
    fn parses_plain_json() {
        let value = safe_json_parse(r#"{"core_topic": "Algebra"}"#).unwrap();
        assert_eq!(value["core_topic"], "Algebra");
    }

    #[test]
    fn strips_markdown_fences() {
        let value = safe_json_parse("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn repairs_missing_closing_brace() {
        let value = safe_json_parse(r#"{"a": {"b": 2}"#).unwrap();
        assert_eq!(value["a"]["b"], 2);
    }

    #[test]
    fn rejects_unrecoverable_text() {
        assert!(safe_json_parse("not json at all").is_err());
    }

    #[test]
    fn recognizes_subject_urls() {
        assert!(is_subject_url(
            "https://guiadocent.example.edu/fitxa?assignatura=101&any=2024"
        ));
        assert!(is_subject_url("https://fib.upc.edu/en/syllabus/IDI"));
        assert!(!is_subject_url("https://example.edu/en/contact"));
    }

    #[test]
    fn extracts_and_resolves_candidate_links() {
        let html = r#"
            <table>
              <tr><td><a href="/syllabus/ALG1">Algebra I</a></td></tr>
              <tr><td><a href="fitxa?asignatura=22">Fonaments de <b>Computadors</b></a></td></tr>
              <tr><td><a href="/en/contact">Contact us</a></td></tr>
              <tr><td><a href="/syllabus/ALG1">Algebra I duplicate</a></td></tr>
            </table>"#;
        let links = candidate_links_from_html("https://uni.example.edu/grade/", html, 10).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].name, "Algebra I");
        assert_eq!(links[0].url, "https://uni.example.edu/syllabus/ALG1");
        assert_eq!(links[1].name, "Fonaments de Computadors");
        assert_eq!(
            links[1].url,
            "https://uni.example.edu/grade/fitxa?asignatura=22"
        );
    }

    #[tokio::test]
    async fn extraction_errors_on_unparseable_url() {
        assert!(extract_subject_text("not a url", "X").await.is_err());
    }

    #[test]
    fn candidate_links_respect_max() {
        let html = r#"<a href="/syllabus/A1">a</a><a href="/syllabus/B2">b</a>"#;
        let links = candidate_links_from_html("https://uni.example.edu/", html, 1).unwrap();
        assert_eq!(links.len(), 1);
    }

    #[tokio::test]
    async fn theme_extraction_joins_list_contents() {
        let llm = ScriptedGenerator::new(vec![
            r#"{"core_topic": "Algorithms", "key_contents": ["Sorting", "Searching"], "application_domain": "CS"}"#,
        ]);
        let theme = extract_theme(&llm, "syllabus text", Some("Algorithms")).await;
        assert_eq!(theme.core_topic, "Algorithms");
        assert_eq!(theme.key_contents, "Sorting, Searching");
        assert_eq!(theme.application_domain, "CS");
    }

    #[tokio::test]
    async fn theme_extraction_falls_back_after_retries() {
        let llm = ScriptedGenerator::new(vec!["garbage", "more garbage", "still garbage"]);
        let theme = extract_theme(&llm, "text", Some("Databases")).await;
        assert_eq!(theme.core_topic, "Databases");
        assert_eq!(theme.application_domain, "General Education");
        assert_eq!(*llm.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn theme_defaults_missing_domain() {
        let llm = ScriptedGenerator::new(vec![
            r#"{"core_topic": "Physics", "key_contents": "Mechanics", "application_domain": ""}"#,
        ]);
        let theme = extract_theme(&llm, "text", None).await;
        assert_eq!(theme.application_domain, "General Education");
    }

    #[tokio::test]
    async fn subject_fields_are_normalized_and_capped() {
        let contents: Vec<String> = (1..=10)
            .map(|i| format!(r#""Topic {}": ["sub"]"#, i))
            .collect();
        let response = format!(
            r#"{{"Physics": {{"competences": ["Analyze circuits"], "objectives": [], "contents": {{{}}}}}}}"#,
            contents.join(", ")
        );
        let llm = ScriptedGenerator::new(vec![&response]);
        let subjects = extract_subject_fields(&llm, "text", "Physics").await.unwrap();
        let fields = &subjects["Physics"];
        assert!(fields.competences.contains("Analyze circuits"));
        let parsed: Value = serde_json::from_str(&fields.contents).unwrap();
        assert_eq!(parsed.as_object().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn subject_fields_error_on_non_object() {
        let llm = ScriptedGenerator::new(vec![r#"["not", "an", "object"]"#]);
        assert!(extract_subject_fields(&llm, "text", "X").await.is_err());
    }
}
