use anyhow::Result;
use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{
    BertModel, Config as BertConfig, HiddenAct, PositionEmbeddingType,
};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::TARGET_EMBEDDING;

static MODEL: OnceCell<Arc<BertModel>> = OnceCell::new();
static TOKENIZER: OnceCell<Arc<Tokenizer>> = OnceCell::new();

const MODEL_URL: &str =
    "https://huggingface.co/intfloat/e5-large-v2/resolve/main/model.safetensors";
const TOKENIZER_URL: &str =
    "https://huggingface.co/intfloat/e5-large-v2/resolve/main/tokenizer.json";

/// Fixed penalty applied to adjusted similarities, soaking up the baseline
/// cosine noise between unrelated academic texts.
const ADJUST_PENALTY: f32 = 0.1;
/// Below this length ratio one text is likely a fragment of the other.
const LENGTH_RATIO_FLOOR: f32 = 0.6;
const LENGTH_RATIO_SCALE: f32 = 0.8;

/// Text-to-vector seam. The production implementation runs a local E5 model;
/// tests substitute a deterministic fake.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

struct E5Config {
    model_path: String,
    tokenizer_path: String,
    dimensions: usize,
    max_length: usize,
    device: Device,
}

impl Default for E5Config {
    fn default() -> Self {
        Self {
            model_path: "models/e5-large-v2.safetensors".to_string(),
            tokenizer_path: "models/e5-tokenizer.json".to_string(),
            dimensions: 1024,
            max_length: 512,
            device: Device::Cpu,
        }
    }
}

impl E5Config {
    async fn ensure_models_exist(&self) -> Result<()> {
        if !Path::new("models").exists() {
            fs::create_dir("models").await?;
        }

        if !Path::new(&self.model_path).exists() {
            info!(target: TARGET_EMBEDDING, "Downloading E5 model from {}", MODEL_URL);
            let response = reqwest::get(MODEL_URL).await?;
            let bytes = response.bytes().await?;
            fs::write(&self.model_path, bytes).await?;
            info!(target: TARGET_EMBEDDING, "Downloaded E5 model to {}", self.model_path);
        }

        if !Path::new(&self.tokenizer_path).exists() {
            info!(target: TARGET_EMBEDDING, "Downloading E5 tokenizer from {}", TOKENIZER_URL);
            let response = reqwest::get(TOKENIZER_URL).await?;
            let bytes = response.bytes().await?;
            fs::write(&self.tokenizer_path, bytes).await?;
            info!(target: TARGET_EMBEDDING, "Downloaded E5 tokenizer to {}", self.tokenizer_path);
        }

        Ok(())
    }
}

fn init_e5_model(config: &E5Config) -> Result<()> {
    let bert_config = BertConfig {
        hidden_size: config.dimensions,
        intermediate_size: 4096,
        max_position_embeddings: config.max_length,
        num_attention_heads: 16,
        num_hidden_layers: 24,
        vocab_size: 250000,
        layer_norm_eps: 1e-12,
        pad_token_id: 0,
        hidden_act: HiddenAct::Gelu,
        hidden_dropout_prob: 0.0,
        type_vocab_size: 1,
        initializer_range: 0.02,
        position_embedding_type: PositionEmbeddingType::Absolute,
        use_cache: false,
        classifier_dropout: None,
        model_type: None,
    };

    info!(target: TARGET_EMBEDDING, "Loading E5 model from {}", config.model_path);

    let tensors =
        candle_core::safetensors::load_buffer(&std::fs::read(&config.model_path)?, &config.device)?;
    let vb = VarBuilder::from_tensors(tensors, DType::F32, &config.device);
    let model = BertModel::load(vb, &bert_config)?;

    MODEL
        .set(Arc::new(model))
        .map_err(|_| anyhow::anyhow!("Failed to set model"))?;
    Ok(())
}

fn init_e5_tokenizer(config: &E5Config) -> Result<()> {
    info!(target: TARGET_EMBEDDING, "Loading E5 tokenizer from {}", config.tokenizer_path);
    let tokenizer = Tokenizer::from_file(&config.tokenizer_path)
        .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;
    TOKENIZER
        .set(Arc::new(tokenizer))
        .map_err(|_| anyhow::anyhow!("Failed to set tokenizer"))?;
    Ok(())
}

/// Local E5 embedding model, loaded once at startup and shared across
/// requests via module statics.
pub struct E5Embedder {
    config: E5Config,
}

impl E5Embedder {
    pub async fn new() -> Result<Self> {
        let config = E5Config::default();
        config.ensure_models_exist().await?;
        if MODEL.get().is_none() {
            init_e5_model(&config)?;
        }
        if TOKENIZER.get().is_none() {
            init_e5_tokenizer(&config)?;
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl Embedder for E5Embedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = MODEL
            .get()
            .ok_or_else(|| anyhow::anyhow!("E5 model not initialized"))?;
        let tokenizer = TOKENIZER
            .get()
            .ok_or_else(|| anyhow::anyhow!("E5 tokenizer not initialized"))?;

        let prefixed_text = format!("passage: {}", text);
        let encoding = tokenizer
            .encode(prefixed_text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;

        let input_ids = Tensor::new(
            encoding
                .get_ids()
                .iter()
                .map(|&x| x as i64)
                .collect::<Vec<_>>(),
            &self.config.device,
        )?;
        let attention_mask = Tensor::new(
            encoding
                .get_attention_mask()
                .iter()
                .map(|&x| x as i64)
                .collect::<Vec<_>>(),
            &self.config.device,
        )?;

        let input_ids = input_ids.unsqueeze(0)?;
        let attention_mask = attention_mask.unsqueeze(0)?;

        let hidden_state = model.forward(&input_ids, &attention_mask, None)?;

        // Mean pooling over non-padding tokens, then L2 normalization.
        let mask = attention_mask.unsqueeze(2)?;
        let mask = mask.to_dtype(DType::F32)?;
        let masked = hidden_state.mul(&mask)?;
        let summed = masked.sum(1)?;
        let counts = mask.sum(1)?;
        let mean_pooled = summed.div(&counts)?;

        let norm = mean_pooled.sqr()?.sum_all()?.sqrt()?;
        let normalized = mean_pooled.div(&norm)?;

        let vector = normalized.squeeze(0)?.to_vec1::<f32>()?;

        debug!(target: TARGET_EMBEDDING,
            "Generated embedding: {} dims from {} chars ({} tokens)",
            vector.len(),
            text.len(),
            encoding.get_ids().len()
        );

        Ok(vector)
    }
}

/// Cosine similarity between two equal-dimension vectors.
pub fn cosine_similarity(vec1: &[f32], vec2: &[f32]) -> Result<f32> {
    if vec1.len() != vec2.len() {
        return Err(anyhow::anyhow!(
            "Vector dimensions don't match: {} vs {}",
            vec1.len(),
            vec2.len()
        ));
    }

    let mag1: f32 = vec1.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag2: f32 = vec2.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag1 < 0.001 || mag2 < 0.001 {
        return Err(anyhow::anyhow!("Zero magnitude vector detected"));
    }

    let dot_product: f32 = vec1.iter().zip(vec2.iter()).map(|(a, b)| a * b).sum();
    Ok(dot_product / (mag1 * mag2))
}

/// Applies the short-text penalty: subtract a fixed amount flooring at zero,
/// then scale down when the texts have very different lengths.
fn adjust_similarity(raw: f32, len_a: usize, len_b: usize) -> f32 {
    let mut adjusted = (raw - ADJUST_PENALTY).max(0.0);
    let len_ratio = len_a.min(len_b) as f32 / len_a.max(len_b) as f32;
    if len_ratio < LENGTH_RATIO_FLOOR {
        adjusted *= LENGTH_RATIO_SCALE;
    }
    adjusted
}

/// Embedding cosine similarity between two text blobs.
///
/// Empty input or any provider failure degrades to 0.0 so one weak signal
/// never aborts a comparison.
pub async fn embedding_similarity(
    embedder: &dyn Embedder,
    text_a: &str,
    text_b: &str,
    adjust: bool,
) -> f32 {
    if text_a.trim().is_empty() || text_b.trim().is_empty() {
        warn!(target: TARGET_EMBEDDING, "One of the texts is empty, returning 0");
        return 0.0;
    }

    let raw = match tokio::try_join!(embedder.embed(text_a), embedder.embed(text_b)) {
        Ok((emb_a, emb_b)) => match cosine_similarity(&emb_a, &emb_b) {
            Ok(similarity) => similarity,
            Err(e) => {
                warn!(target: TARGET_EMBEDDING, "Failed to compute cosine similarity: {}", e);
                return 0.0;
            }
        },
        Err(e) => {
            warn!(target: TARGET_EMBEDDING, "Embedding generation failed: {}", e);
            return 0.0;
        }
    };

    let similarity = if adjust {
        adjust_similarity(raw, text_a.len(), text_b.len())
    } else {
        raw
    };

    debug!(target: TARGET_EMBEDDING, "Similarity calculated: {:.4} (raw: {:.4})", similarity, raw);
    similarity
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            // Orthogonal unit vectors for distinct first letters.
            match text.chars().next() {
                Some('a') => Ok(vec![1.0, 0.0]),
                Some('b') => Ok(vec![0.0, 1.0]),
                _ => Ok(vec![1.0, 0.0]),
            }
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(anyhow!("provider unavailable"))
        }
    }

    #[test]
    fn cosine_identical_vectors_is_one() {
        let v = vec![0.3, 0.4, 0.5];
        let sim = cosine_similarity(&v, &v).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors_is_zero() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn cosine_rejects_dimension_mismatch() {
        assert!(cosine_similarity(&[1.0, 0.0], &[1.0]).is_err());
    }

    #[test]
    fn adjust_subtracts_penalty_and_floors_at_zero() {
        assert!((adjust_similarity(0.5, 100, 100) - 0.4).abs() < 1e-6);
        assert_eq!(adjust_similarity(0.05, 100, 100), 0.0);
    }

    #[test]
    fn adjust_scales_down_mismatched_lengths() {
        // ratio 0.2 < 0.6, so (0.9 - 0.1) * 0.8
        assert!((adjust_similarity(0.9, 20, 100) - 0.64).abs() < 1e-6);
        // ratio exactly at the floor is not penalized
        assert!((adjust_similarity(0.9, 60, 100) - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn empty_text_short_circuits_to_zero() {
        let sim = embedding_similarity(&FixedEmbedder, "   ", "algebra", true).await;
        assert_eq!(sim, 0.0);
    }

    #[tokio::test]
    async fn provider_failure_degrades_to_zero() {
        let sim = embedding_similarity(&FailingEmbedder, "algebra", "calculus", true).await;
        assert_eq!(sim, 0.0);
    }

    #[tokio::test]
    async fn unadjusted_similarity_is_raw_cosine() {
        let sim = embedding_similarity(&FixedEmbedder, "algebra", "arithmetic", false).await;
        assert!((sim - 1.0).abs() < 1e-6);
        let sim = embedding_similarity(&FixedEmbedder, "algebra", "biology", false).await;
        assert!(sim.abs() < 1e-6);
    }
}
