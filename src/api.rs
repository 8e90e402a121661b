use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::orchestrator::{
    self, CompareError, GuideComparison, Services, SubjectsComparison,
};

#[derive(Deserialize)]
pub struct CompareSubjectsRequest {
    pub url1: String,
    pub subject_title1: String,
    pub url2: String,
    pub subject_title2: String,
}

#[derive(Deserialize)]
pub struct CompareRequest {
    pub url1: String,
    pub url2: String,
    pub subject_title: String,
}

#[derive(Serialize)]
struct HistoryItem {
    id: i64,
    created_at: String,
    url1: String,
    subject_title1: String,
    url2: String,
    subject_title2: String,
    similarity_score: f64,
    components: crate::comparators::ComponentScores,
    analysis: crate::comparators::QualitativeReport,
    explanation: String,
    comparison_type: String,
}

#[derive(Serialize)]
struct Message {
    message: String,
}

impl IntoResponse for CompareError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            CompareError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            CompareError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            CompareError::Internal(e) => {
                error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Unexpected error: {}", e),
                )
            }
        };
        (status, Json(Message { message })).into_response()
    }
}

fn require_non_empty(fields: &[(&str, &str)]) -> Result<(), CompareError> {
    for (name, value) in fields {
        if value.trim().is_empty() {
            return Err(CompareError::BadRequest(format!(
                "Field '{}' must not be empty",
                name
            )));
        }
    }
    Ok(())
}

async fn compare_subjects(
    State(services): State<Services>,
    Json(request): Json<CompareSubjectsRequest>,
) -> Result<Json<SubjectsComparison>, CompareError> {
    require_non_empty(&[
        ("url1", &request.url1),
        ("subject_title1", &request.subject_title1),
        ("url2", &request.url2),
        ("subject_title2", &request.subject_title2),
    ])?;

    let comparison = orchestrator::compare_two_subjects(
        &services,
        &request.url1,
        &request.subject_title1,
        &request.url2,
        &request.subject_title2,
    )
    .await?;
    Ok(Json(comparison))
}

async fn compare(
    State(services): State<Services>,
    Json(request): Json<CompareRequest>,
) -> Result<Json<GuideComparison>, CompareError> {
    require_non_empty(&[
        ("url1", &request.url1),
        ("url2", &request.url2),
        ("subject_title", &request.subject_title),
    ])?;

    let comparison = orchestrator::compare_against_guide(
        &services,
        &request.url1,
        &request.subject_title,
        &request.url2,
    )
    .await?;
    Ok(Json(comparison))
}

async fn comparison_history(
    State(services): State<Services>,
) -> Result<Json<Vec<HistoryItem>>, CompareError> {
    let rows = services.db.list_all().await?;
    let items = rows
        .iter()
        .map(|row| HistoryItem {
            id: row.id,
            created_at: row.created_at.clone(),
            url1: row.url1.clone(),
            subject_title1: row.subject_title1.clone(),
            url2: row.url2.clone(),
            subject_title2: row.subject_title2.clone(),
            similarity_score: row.similarity_score,
            components: row.components(),
            analysis: row.analysis(),
            explanation: row.explanation.clone().unwrap_or_default(),
            comparison_type: row.comparison_type.clone(),
        })
        .collect();
    Ok(Json(items))
}

async fn clear_history(
    State(services): State<Services>,
) -> Result<Json<Message>, CompareError> {
    let removed = services.db.clear().await?;
    info!("Comparison history cleared ({} rows)", removed);
    Ok(Json(Message {
        message: "History cleared successfully".to_string(),
    }))
}

async fn status_check() -> &'static str {
    "OK"
}

/// Builds the router and serves the API until the process exits.
pub async fn serve(services: Services) -> Result<()> {
    let app = Router::new()
        .route("/status", get(status_check))
        .route("/compare-subjects", post(compare_subjects))
        .route("/compare", post(compare))
        .route("/comparison-history", get(comparison_history))
        .route("/clear-history", delete(clear_history))
        .with_state(services);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = format!("0.0.0.0:{}", port);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Server running on http://{}", addr);

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::embedding::Embedder;
    use crate::llm::TextGenerator;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(anyhow!("provider unavailable"))
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl TextGenerator for FailingGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Err(anyhow!("model offline"))
        }
    }

    #[tokio::test]
    async fn serve_surfaces_bind_errors() {
        let occupied = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        std::env::set_var("PORT", port.to_string());

        let db = Database::new_in_memory().await.unwrap();
        let services = Services::new(db, Arc::new(FailingEmbedder), Arc::new(FailingGenerator));
        let result = serve(services).await;
        std::env::remove_var("PORT");
        assert!(result.is_err());
    }
}
