pub mod content;
pub mod theme;

pub use content::{similarity_score, ComponentScores, ContentAnalysis, QualitativeReport};
pub use theme::compare_themes;
