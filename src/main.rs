use anyhow::Result;
use async_openai::Client as OpenAIClient;
use ollama_rs::Ollama;
use std::env;
use std::sync::Arc;
use tracing::info;

use cotejo::api;
use cotejo::db::Database;
use cotejo::embedding::E5Embedder;
use cotejo::llm::{LLMClient, LLMParams};
use cotejo::logging::configure_logging;
use cotejo::orchestrator::Services;

#[tokio::main]
async fn main() -> Result<()> {
    configure_logging();

    let llm_client = if env::var("OPENAI_API_KEY").is_ok() {
        let model = env::var("OPENAI_MODEL").unwrap_or("gpt-4o-mini".to_string());
        info!("Using OpenAI backend with model {}", model);
        (LLMClient::OpenAI(OpenAIClient::new()), model)
    } else {
        let ollama_host = env::var("OLLAMA_HOST").unwrap_or("localhost".to_string());
        let ollama_port: u16 = env::var("OLLAMA_PORT")
            .unwrap_or("11434".to_string())
            .parse()
            .unwrap_or(11434);
        let model = env::var("OLLAMA_MODEL").unwrap_or("llama3".to_string());
        info!("Connecting to Ollama at {}:{} with model {}", ollama_host, ollama_port, model);
        (
            LLMClient::Ollama(Ollama::new(ollama_host, ollama_port)),
            model,
        )
    };

    let temperature: f32 = env::var("LLM_TEMPERATURE")
        .unwrap_or("0.2".to_string())
        .parse()
        .unwrap_or(0.2);

    let (client, model) = llm_client;
    let llm = Arc::new(LLMParams::new(client, model, temperature));

    info!("Loading embedding model...");
    let embedder = Arc::new(E5Embedder::new().await?);

    let db_path = env::var("DATABASE_PATH").unwrap_or("comparisons.db".to_string());
    let db = Database::new(&db_path).await?;

    let services = Services::new(db, embedder, llm);
    api::serve(services).await
}
