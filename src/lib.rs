pub mod api;
pub mod comparators;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod fuzzy;
pub mod llm;
pub mod logging;
pub mod orchestrator;
pub mod prompts;

pub const TARGET_WEB_REQUEST: &str = "web_request";
pub const TARGET_LLM_REQUEST: &str = "llm_request";
pub const TARGET_DB: &str = "db_query";
pub const TARGET_EMBEDDING: &str = "embedding";
