use anyhow::{anyhow, Result};
use async_openai::types::{ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs};
use async_openai::{config::OpenAIConfig, Client as OpenAIClient};
use async_trait::async_trait;
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::generation::options::GenerationOptions;
use ollama_rs::Ollama;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::TARGET_LLM_REQUEST;

const LLM_TIMEOUT_SECS: u64 = 120;
const MAX_RETRIES: usize = 3;

/// Single-method seam over the backing language model so scorers and
/// extractors can be exercised with a deterministic fake in tests.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

#[derive(Clone, Debug)]
pub enum LLMClient {
    Ollama(Ollama),
    OpenAI(OpenAIClient<OpenAIConfig>),
}

/// Long-lived model handle plus generation settings, constructed once at
/// startup and shared by reference across all requests.
#[derive(Clone)]
pub struct LLMParams {
    pub client: LLMClient,
    pub model: String,
    pub temperature: f32,
}

impl LLMParams {
    pub fn new(client: LLMClient, model: String, temperature: f32) -> Self {
        Self {
            client,
            model,
            temperature,
        }
    }

    async fn generate_once(&self, prompt: &str) -> Result<String> {
        match &self.client {
            LLMClient::Ollama(ollama) => {
                let mut request = GenerationRequest::new(self.model.clone(), prompt.to_string());
                request.options =
                    Some(GenerationOptions::default().temperature(self.temperature));
                let response = ollama
                    .generate(request)
                    .await
                    .map_err(|e| anyhow!("Ollama generation failed: {}", e))?;
                Ok(response.response)
            }
            LLMClient::OpenAI(client) => {
                let request = CreateChatCompletionRequestArgs::default()
                    .model(&self.model)
                    .temperature(self.temperature)
                    .messages([ChatCompletionRequestUserMessageArgs::default()
                        .content(prompt)
                        .build()?
                        .into()])
                    .build()?;
                let response = client.chat().create(request).await?;
                response
                    .choices
                    .first()
                    .and_then(|choice| choice.message.content.clone())
                    .ok_or_else(|| anyhow!("OpenAI response contained no content"))
            }
        }
    }
}

#[async_trait]
impl TextGenerator for LLMParams {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let mut backoff = 2;

        debug!(target: TARGET_LLM_REQUEST, "Starting LLM response generation, prompt length {}", prompt.len());

        for retry_count in 0..MAX_RETRIES {
            match timeout(
                Duration::from_secs(LLM_TIMEOUT_SECS),
                self.generate_once(prompt),
            )
            .await
            {
                Ok(Ok(response)) => {
                    debug!(target: TARGET_LLM_REQUEST, "LLM response received ({} chars)", response.len());
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    warn!(target: TARGET_LLM_REQUEST, "Error generating response: {}", e);
                }
                Err(_) => {
                    warn!(target: TARGET_LLM_REQUEST, "LLM request timed out after {}s", LLM_TIMEOUT_SECS);
                }
            }

            if retry_count < MAX_RETRIES - 1 {
                info!(target: TARGET_LLM_REQUEST, "Retrying LLM request... ({}/{})", retry_count + 1, MAX_RETRIES);
                sleep(Duration::from_secs(backoff)).await;
                backoff *= 2;
            }
        }

        error!(target: TARGET_LLM_REQUEST, "No response generated after {} retries", MAX_RETRIES);
        Err(anyhow!(
            "LLM generation failed after {} retries",
            MAX_RETRIES
        ))
    }
}
