use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Sqlite,
};
use std::str::FromStr;
use tokio::time::Duration;
use tracing::{info, instrument};

use crate::comparators::{ComponentScores, QualitativeReport};
use crate::extract::SubjectFields;
use crate::TARGET_DB;

pub const TYPE_SUBJECTS: &str = "compare-subjects";
pub const TYPE_GUIDE: &str = "compare";

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

/// A persisted comparison. The tuple (url1, subject_title1, url2,
/// subject_title2, comparison_type) is the natural dedup key; rows are never
/// updated after insertion.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ComparisonRow {
    pub id: i64,
    pub created_at: String,
    pub url1: String,
    pub subject_title1: String,
    pub guide_url: Option<String>,
    pub url2: String,
    pub subject_title2: String,
    pub similarity_score: f64,
    pub theme_similarity: Option<f64>,
    pub components: Option<String>,
    pub analysis: Option<String>,
    pub explanation: Option<String>,
    pub comparison_type: String,
    pub source_detail: Option<String>,
    pub candidate_detail: Option<String>,
}

impl ComparisonRow {
    pub fn components(&self) -> ComponentScores {
        self.components
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default()
    }

    pub fn analysis(&self) -> QualitativeReport {
        self.analysis
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default()
    }

    pub fn source_detail(&self) -> SubjectFields {
        self.source_detail
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default()
    }

    pub fn candidate_detail(&self) -> SubjectFields {
        self.candidate_detail
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default()
    }
}

/// Insert payload for a freshly computed comparison.
pub struct NewComparison<'a> {
    pub url1: &'a str,
    pub subject_title1: &'a str,
    pub guide_url: Option<&'a str>,
    pub url2: &'a str,
    pub subject_title2: &'a str,
    pub similarity_score: f64,
    pub theme_similarity: Option<f64>,
    pub components: &'a ComponentScores,
    pub analysis: &'a QualitativeReport,
    pub explanation: &'a str,
    pub comparison_type: &'a str,
    pub source_detail: Option<&'a SubjectFields>,
    pub candidate_detail: Option<&'a SubjectFields>,
}

impl Database {
    #[instrument(target = "db_query", level = "info")]
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        info!(target: TARGET_DB, "Creating database pool for: {}", database_url);

        let connect_options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", database_url))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5))
                .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;

        info!(target: TARGET_DB, "Database pool created");

        let db = Database { pool };
        db.initialize_schema().await?;
        Ok(db)
    }

    #[cfg(test)]
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;
        let db = Database { pool };
        db.initialize_schema().await?;
        Ok(db)
    }

    async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS comparisons (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                url1 TEXT NOT NULL,
                subject_title1 TEXT NOT NULL,
                guide_url TEXT,
                url2 TEXT NOT NULL,
                subject_title2 TEXT NOT NULL,
                similarity_score REAL NOT NULL,
                theme_similarity REAL,
                components TEXT,
                analysis TEXT,
                explanation TEXT,
                comparison_type TEXT NOT NULL,
                source_detail TEXT,
                candidate_detail TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_comparisons_pair \
             ON comparisons (url1, subject_title1, url2, subject_title2, comparison_type)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_comparisons_guide \
             ON comparisons (url1, subject_title1, guide_url, comparison_type)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Point lookup on the natural pair key; serves as the comparison cache.
    pub async fn find_pair(
        &self,
        url1: &str,
        subject_title1: &str,
        url2: &str,
        subject_title2: &str,
        comparison_type: &str,
    ) -> Result<Option<ComparisonRow>, sqlx::Error> {
        sqlx::query_as::<_, ComparisonRow>(
            r#"
            SELECT * FROM comparisons
            WHERE url1 = ? AND subject_title1 = ? AND url2 = ? AND subject_title2 = ?
              AND comparison_type = ?
            LIMIT 1
            "#,
        )
        .bind(url1)
        .bind(subject_title1)
        .bind(url2)
        .bind(subject_title2)
        .bind(comparison_type)
        .fetch_optional(&self.pool)
        .await
    }

    /// All stored comparisons for one reference subject against one guide.
    pub async fn find_by_guide(
        &self,
        url1: &str,
        subject_title1: &str,
        guide_url: &str,
    ) -> Result<Vec<ComparisonRow>, sqlx::Error> {
        sqlx::query_as::<_, ComparisonRow>(
            r#"
            SELECT * FROM comparisons
            WHERE url1 = ? AND subject_title1 = ? AND guide_url = ? AND comparison_type = ?
            "#,
        )
        .bind(url1)
        .bind(subject_title1)
        .bind(guide_url)
        .bind(TYPE_GUIDE)
        .fetch_all(&self.pool)
        .await
    }

    /// Single insert-and-commit; there is deliberately no update path.
    pub async fn add_comparison(&self, new: &NewComparison<'_>) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO comparisons (
                created_at, url1, subject_title1, guide_url, url2, subject_title2,
                similarity_score, theme_similarity, components, analysis, explanation,
                comparison_type, source_detail, candidate_detail
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(new.url1)
        .bind(new.subject_title1)
        .bind(new.guide_url)
        .bind(new.url2)
        .bind(new.subject_title2)
        .bind(new.similarity_score)
        .bind(new.theme_similarity)
        .bind(serde_json::to_string(new.components).ok())
        .bind(serde_json::to_string(new.analysis).ok())
        .bind(new.explanation)
        .bind(new.comparison_type)
        .bind(
            new.source_detail
                .and_then(|detail| serde_json::to_string(detail).ok()),
        )
        .bind(
            new.candidate_detail
                .and_then(|detail| serde_json::to_string(detail).ok()),
        )
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn list_all(&self) -> Result<Vec<ComparisonRow>, sqlx::Error> {
        sqlx::query_as::<_, ComparisonRow>("SELECT * FROM comparisons ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn clear(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM comparisons")
            .execute(&self.pool)
            .await?;
        info!(target: TARGET_DB, "Cleared {} stored comparisons", result.rows_affected());
        Ok(result.rows_affected())
    }
}
