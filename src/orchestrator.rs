use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::comparators::{compare_themes, similarity_score, ComponentScores, QualitativeReport};
use crate::db::{Database, NewComparison, TYPE_GUIDE, TYPE_SUBJECTS};
use crate::embedding::Embedder;
use crate::extract::{
    self, CandidateLink, SubjectFields, SubjectTheme,
};
use crate::fuzzy;
use crate::llm::TextGenerator;

/// Candidates below this theme similarity are not worth a detailed comparison.
const THEME_FILTER_THRESHOLD: f32 = 0.66;
/// Theme extraction is cheap, so its pool is wider than the detail pool.
const THEME_WORKERS: usize = 5;
const DETAIL_WORKERS: usize = 4;
const MAX_GUIDE_SUBJECTS: usize = 10;
const TOP_MATCHES: usize = 5;

const TITLE_CUTOFF_SUBJECTS: f64 = 0.3;
const TITLE_CUTOFF_GUIDE: f64 = 0.4;

#[derive(Debug, Error)]
pub enum CompareError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for CompareError {
    fn from(e: sqlx::Error) -> Self {
        CompareError::Internal(e.into())
    }
}

/// Long-lived collaborators shared by every request.
#[derive(Clone)]
pub struct Services {
    pub db: Database,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Arc<dyn TextGenerator>,
    /// Singleflight map: concurrent identical requests serialize on a
    /// per-cache-key lock and the loser re-checks the store, so the
    /// read-then-write race cannot produce duplicate rows.
    inflight: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Services {
    pub fn new(db: Database, embedder: Arc<dyn Embedder>, llm: Arc<dyn TextGenerator>) -> Self {
        Self {
            db,
            embedder,
            llm,
            inflight: Arc::new(DashMap::new()),
        }
    }

    async fn lock_key(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .inflight
            .entry(key.to_string())
            .or_default()
            .value()
            .clone();
        lock.lock_owned().await
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SubjectsComparison {
    pub source_subject: String,
    pub source_detail: SubjectFields,
    pub compared_subject: String,
    pub compared_detail: SubjectFields,
    pub content_similarity: f64,
    pub components: ComponentScores,
    pub analysis: QualitativeReport,
    pub explanation: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct GuideMatch {
    pub subject: String,
    pub theme_similarity: Option<f64>,
    pub content_similarity: f64,
    pub components: ComponentScores,
    pub analysis: QualitativeReport,
    pub explanation: String,
    pub detail: SubjectFields,
    pub url: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct GuideComparison {
    pub source_subject: String,
    pub main_theme: SubjectTheme,
    pub source_detail: SubjectFields,
    pub matches: Vec<GuideMatch>,
}

/// Transient survivor of the theme pre-filter phase.
struct FilteredCandidate {
    name: String,
    theme_similarity: f32,
    url: String,
}

fn pair_key(url1: &str, title1: &str, url2: &str, title2: &str, comparison_type: &str) -> String {
    format!("{}|{}|{}|{}|{}", url1, title1, url2, title2, comparison_type)
}

fn guide_key(url1: &str, title1: &str, guide_url: &str) -> String {
    format!("{}|{}|{}|{}", url1, title1, guide_url, TYPE_GUIDE)
}

fn resolve_title(
    requested: &str,
    subjects: &BTreeMap<String, SubjectFields>,
    cutoff: f64,
) -> Result<String, CompareError> {
    let titles: Vec<String> = subjects.keys().cloned().collect();
    fuzzy::best_match(requested, &titles, cutoff)
        .map(str::to_string)
        .ok_or_else(|| {
            CompareError::BadRequest(format!(
                "Subject '{}' not found. Available titles: {:?}",
                requested, titles
            ))
        })
}

/// Final fan-in: order by content similarity only, not submission order.
fn rank_matches(mut matches: Vec<GuideMatch>) -> Vec<GuideMatch> {
    matches.sort_by(|a, b| b.content_similarity.total_cmp(&a.content_similarity));
    matches.truncate(TOP_MATCHES);
    matches
}

fn hydrate_subjects_response(row: &crate::db::ComparisonRow) -> SubjectsComparison {
    SubjectsComparison {
        source_subject: row.subject_title1.clone(),
        source_detail: row.source_detail(),
        compared_subject: row.subject_title2.clone(),
        compared_detail: row.candidate_detail(),
        content_similarity: row.similarity_score,
        components: row.components(),
        analysis: row.analysis(),
        explanation: row.explanation.clone().unwrap_or_default(),
    }
}

fn hydrate_guide_match(row: &crate::db::ComparisonRow) -> GuideMatch {
    GuideMatch {
        subject: row.subject_title2.clone(),
        theme_similarity: row.theme_similarity,
        content_similarity: row.similarity_score,
        components: row.components(),
        analysis: row.analysis(),
        explanation: row.explanation.clone().unwrap_or_default(),
        detail: row.candidate_detail(),
        url: row.url2.clone(),
    }
}

/// Detailed comparison of two individual subjects, cached on the request
/// tuple so repeated calls never re-invoke the providers.
pub async fn compare_two_subjects(
    services: &Services,
    url1: &str,
    subject_title1: &str,
    url2: &str,
    subject_title2: &str,
) -> Result<SubjectsComparison, CompareError> {
    info!("Comparing subjects '{}' ({}) and '{}' ({})", subject_title1, url1, subject_title2, url2);

    if let Some(row) = services
        .db
        .find_pair(url1, subject_title1, url2, subject_title2, TYPE_SUBJECTS)
        .await?
    {
        info!("Comparison already stored, returning cached result");
        return Ok(hydrate_subjects_response(&row));
    }

    let key = pair_key(url1, subject_title1, url2, subject_title2, TYPE_SUBJECTS);
    let _guard = services.lock_key(&key).await;

    // A concurrent identical request may have stored the result while we
    // waited for the lock.
    if let Some(row) = services
        .db
        .find_pair(url1, subject_title1, url2, subject_title2, TYPE_SUBJECTS)
        .await?
    {
        info!("Comparison stored by concurrent request, returning cached result");
        return Ok(hydrate_subjects_response(&row));
    }

    let text1 = extract::extract_subject_text(url1, subject_title1).await?;
    let text2 = extract::extract_subject_text(url2, subject_title2).await?;

    let subjects1 = extract::extract_subject_fields(services.llm.as_ref(), &text1, subject_title1).await?;
    let subjects2 = extract::extract_subject_fields(services.llm.as_ref(), &text2, subject_title2).await?;

    let resolved1 = resolve_title(subject_title1, &subjects1, TITLE_CUTOFF_SUBJECTS)?;
    let resolved2 = resolve_title(subject_title2, &subjects2, TITLE_CUTOFF_SUBJECTS)?;
    let detail1 = subjects1[&resolved1].clone();
    let detail2 = subjects2[&resolved2].clone();

    let analysis = similarity_score(
        services.embedder.as_ref(),
        services.llm.as_ref(),
        &detail1.combined_text(&resolved1),
        &detail2.combined_text(&resolved2),
    )
    .await;

    let content_similarity = analysis.score as f64 * 100.0;
    services
        .db
        .add_comparison(&NewComparison {
            url1,
            subject_title1,
            guide_url: None,
            url2,
            subject_title2,
            similarity_score: content_similarity,
            theme_similarity: None,
            components: &analysis.components,
            analysis: &analysis.llm_analysis,
            explanation: &analysis.explanation,
            comparison_type: TYPE_SUBJECTS,
            source_detail: Some(&detail1),
            candidate_detail: Some(&detail2),
        })
        .await?;

    info!("Comparison completed and stored");
    Ok(SubjectsComparison {
        source_subject: resolved1,
        source_detail: detail1,
        compared_subject: resolved2,
        compared_detail: detail2,
        content_similarity,
        components: analysis.components,
        analysis: analysis.llm_analysis,
        explanation: analysis.explanation,
    })
}

/// Compares one reference subject against every plausible candidate in a
/// degree guide and returns the ranked top matches.
pub async fn compare_against_guide(
    services: &Services,
    url1: &str,
    subject_title: &str,
    guide_url: &str,
) -> Result<GuideComparison, CompareError> {
    info!("Comparing subject '{}' ({}) against guide {}", subject_title, url1, guide_url);

    let reference_text = extract::extract_subject_text(url1, subject_title).await?;
    let main_theme =
        extract::extract_theme(services.llm.as_ref(), &reference_text, Some(subject_title)).await;
    info!("Main theme identified: {:?}", main_theme);

    let subjects =
        extract::extract_subject_fields(services.llm.as_ref(), &reference_text, subject_title)
            .await?;
    let resolved_title = resolve_title(subject_title, &subjects, TITLE_CUTOFF_GUIDE)?;
    let source_detail = subjects[&resolved_title].clone();
    let combined_reference = source_detail.combined_text(&resolved_title);

    let stored = services
        .db
        .find_by_guide(url1, &resolved_title, guide_url)
        .await?;
    if !stored.is_empty() {
        info!("Found {} stored comparisons for this guide, returning cached results", stored.len());
        let matches = rank_matches(stored.iter().map(hydrate_guide_match).collect());
        return Ok(GuideComparison {
            source_subject: resolved_title,
            main_theme,
            source_detail,
            matches,
        });
    }

    let key = guide_key(url1, &resolved_title, guide_url);
    let _guard = services.lock_key(&key).await;

    let stored = services
        .db
        .find_by_guide(url1, &resolved_title, guide_url)
        .await?;
    if !stored.is_empty() {
        let matches = rank_matches(stored.iter().map(hydrate_guide_match).collect());
        return Ok(GuideComparison {
            source_subject: resolved_title,
            main_theme,
            source_detail,
            matches,
        });
    }

    let candidates = extract::extract_candidates(guide_url, MAX_GUIDE_SUBJECTS).await?;
    info!("Guide contains {} candidate subjects", candidates.len());

    let filtered = theme_filter_phase(services, &main_theme, &resolved_title, candidates).await;
    info!("Candidates surviving theme filter: {}", filtered.len());

    let matches = detail_phase(
        services,
        url1,
        &resolved_title,
        guide_url,
        &combined_reference,
        filtered,
    )
    .await;

    Ok(GuideComparison {
        source_subject: resolved_title,
        main_theme,
        source_detail,
        matches: rank_matches(matches),
    })
}

/// Concurrently extracts each candidate's theme and keeps those similar
/// enough to the reference. One failing candidate never aborts the batch.
async fn theme_filter_phase(
    services: &Services,
    main_theme: &SubjectTheme,
    reference_title: &str,
    candidates: Vec<CandidateLink>,
) -> Vec<FilteredCandidate> {
    let semaphore = Arc::new(Semaphore::new(THEME_WORKERS));
    let mut tasks = JoinSet::new();

    for candidate in candidates {
        let services = services.clone();
        let main_theme = main_theme.clone();
        let reference_title = reference_title.to_string();
        let semaphore = Arc::clone(&semaphore);

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;

            let text = match extract::extract_subject_text(&candidate.url, &candidate.name).await {
                Ok(text) => text,
                Err(e) => {
                    error!("Error extracting candidate '{}': {}", candidate.name, e);
                    return None;
                }
            };
            let theme =
                extract::extract_theme(services.llm.as_ref(), &text, Some(&candidate.name)).await;
            let theme_similarity = compare_themes(
                services.embedder.as_ref(),
                services.llm.as_ref(),
                &main_theme,
                &theme,
                &reference_title,
                &candidate.name,
            )
            .await;
            info!(
                "Theme comparison: {} - similarity {:.2}",
                candidate.name, theme_similarity
            );

            if theme_similarity >= THEME_FILTER_THRESHOLD {
                Some(FilteredCandidate {
                    name: candidate.name,
                    theme_similarity,
                    url: candidate.url,
                })
            } else {
                None
            }
        });
    }

    let mut filtered = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Some(candidate)) => filtered.push(candidate),
            Ok(None) => {}
            Err(e) => error!("Theme filter task panicked: {}", e),
        }
    }
    filtered
}

/// Concurrently runs the detailed comparison for every surviving candidate,
/// reusing stored pair results where available.
async fn detail_phase(
    services: &Services,
    url1: &str,
    reference_title: &str,
    guide_url: &str,
    combined_reference: &str,
    filtered: Vec<FilteredCandidate>,
) -> Vec<GuideMatch> {
    let semaphore = Arc::new(Semaphore::new(DETAIL_WORKERS));
    let mut tasks = JoinSet::new();

    for candidate in filtered {
        let services = services.clone();
        let url1 = url1.to_string();
        let reference_title = reference_title.to_string();
        let guide_url = guide_url.to_string();
        let combined_reference = combined_reference.to_string();
        let semaphore = Arc::clone(&semaphore);

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;

            match score_candidate(
                &services,
                &url1,
                &reference_title,
                &guide_url,
                &combined_reference,
                &candidate,
            )
            .await
            {
                Ok(guide_match) => Some(guide_match),
                Err(e) => {
                    error!("Error analyzing candidate '{}': {}", candidate.name, e);
                    None
                }
            }
        });
    }

    let mut matches = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Some(guide_match)) => matches.push(guide_match),
            Ok(None) => {}
            Err(e) => error!("Detail task panicked: {}", e),
        }
    }
    matches
}

async fn score_candidate(
    services: &Services,
    url1: &str,
    reference_title: &str,
    guide_url: &str,
    combined_reference: &str,
    candidate: &FilteredCandidate,
) -> Result<GuideMatch, CompareError> {
    // Reuse a stored pair result, but keep the freshly computed theme score.
    if let Some(row) = services
        .db
        .find_pair(url1, reference_title, &candidate.url, &candidate.name, TYPE_GUIDE)
        .await?
    {
        info!("Comparison already stored for '{}', reusing", candidate.name);
        let mut guide_match = hydrate_guide_match(&row);
        guide_match.theme_similarity = Some(candidate.theme_similarity as f64);
        return Ok(guide_match);
    }

    let text = extract::extract_subject_text(&candidate.url, &candidate.name).await?;
    let subjects =
        extract::extract_subject_fields(services.llm.as_ref(), &text, &candidate.name).await?;
    let (subject_name, detail) = subjects
        .into_iter()
        .next()
        .ok_or_else(|| CompareError::Internal(anyhow::anyhow!("No subject extracted")))?;

    let analysis = similarity_score(
        services.embedder.as_ref(),
        services.llm.as_ref(),
        combined_reference,
        &detail.combined_text(&subject_name),
    )
    .await;
    let content_similarity = analysis.score as f64 * 100.0;

    services
        .db
        .add_comparison(&NewComparison {
            url1,
            subject_title1: reference_title,
            guide_url: Some(guide_url),
            url2: &candidate.url,
            subject_title2: &subject_name,
            similarity_score: content_similarity,
            theme_similarity: Some(candidate.theme_similarity as f64),
            components: &analysis.components,
            analysis: &analysis.llm_analysis,
            explanation: &analysis.explanation,
            comparison_type: TYPE_GUIDE,
            source_detail: None,
            candidate_detail: Some(&detail),
        })
        .await?;

    Ok(GuideMatch {
        subject: subject_name,
        theme_similarity: Some(candidate.theme_similarity as f64),
        content_similarity,
        components: analysis.components,
        analysis: analysis.llm_analysis,
        explanation: analysis.explanation,
        detail,
        url: candidate.url.clone(),
    })
}
