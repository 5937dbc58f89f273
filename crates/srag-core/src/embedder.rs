//! Lazy-loaded text embedder (C3): a thin adapter over an ONNX encoder.
//!
//! Grounded on the same session/tokenizer lifecycle as the reranker (C4)
//! and the local LLM engine (C5): a model handle starts `Unloaded`, moves
//! through `Loading` under the embedder's own mutex, and becomes `Loaded`
//! atomically from the caller's perspective — no partial visibility of a
//! half-built session.

use crate::config::ModelDefaults;
use crate::error::{Result, SragError};
use crate::model_store;
use ndarray::Array2;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::PathBuf;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tokio::sync::Mutex;
use tracing::{debug, info};

const MAX_SEQUENCE_LENGTH: usize = 512;

struct Loaded {
    session: Session,
    tokenizer: Tokenizer,
}

/// Lazy-loaded BGE-small-en-v1.5 text embedder.
pub struct Embedder {
    cache_dir: Option<PathBuf>,
    model_url: String,
    tokenizer_url: String,
    inner: Mutex<Option<Loaded>>,
}

impl Embedder {
    /// Uses the canonical model/tokenizer download URLs (§4.3).
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self::with_urls(
            cache_dir,
            ModelDefaults::EMBEDDER_MODEL_URL.to_string(),
            ModelDefaults::EMBEDDER_TOKENIZER_URL.to_string(),
        )
    }

    pub fn with_urls(cache_dir: Option<PathBuf>, model_url: String, tokenizer_url: String) -> Self {
        Self {
            cache_dir,
            model_url,
            tokenizer_url,
            inner: Mutex::new(None),
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Idempotent: a second call while already loaded is a no-op.
    pub async fn load(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let model_dir = self
            .cache_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let model_path = model_dir.join(ModelDefaults::EMBEDDER_FILENAME);
        let tokenizer_path = model_dir.join(ModelDefaults::EMBEDDER_TOKENIZER_FILENAME);

        if !model_path.is_file() {
            model_store::download(&model_dir, ModelDefaults::EMBEDDER_FILENAME, &self.model_url, "").await?;
        }
        if !tokenizer_path.is_file() {
            model_store::download(
                &model_dir,
                ModelDefaults::EMBEDDER_TOKENIZER_FILENAME,
                &self.tokenizer_url,
                "",
            )
            .await?;
        }

        debug!(path = %model_path.display(), "loading embedder session");

        let session = Session::builder()
            .map_err(|e| SragError::BackendError(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| SragError::BackendError(e.to_string()))?
            .commit_from_file(&model_path)
            .map_err(|e| SragError::BackendError(e.to_string()))?;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| SragError::BackendError(e.to_string()))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: MAX_SEQUENCE_LENGTH,
                ..Default::default()
            }))
            .map_err(|e| SragError::BackendError(e.to_string()))?;

        *guard = Some(Loaded { session, tokenizer });
        info!(model = ModelDefaults::EMBEDDER_NAME, "embedder loaded");
        Ok(())
    }

    pub async fn unload(&self) {
        *self.inner.lock().await = None;
    }

    /// Embed `texts`, returning exactly one vector per input, in order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.load().await?;
        let guard = self.inner.lock().await;
        let loaded = guard
            .as_ref()
            .ok_or_else(|| SragError::BackendError("embedder not loaded".to_string()))?;

        let encodings = loaded
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| SragError::BackendError(format!("tokenization failed: {e}")))?;

        let batch = encodings.len();
        let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);

        let mut input_ids = Vec::with_capacity(batch * seq_len);
        let mut attention_mask = Vec::with_capacity(batch * seq_len);
        let mut token_type_ids = Vec::with_capacity(batch * seq_len);
        for enc in &encodings {
            input_ids.extend(enc.get_ids().iter().map(|&x| x as i64));
            attention_mask.extend(enc.get_attention_mask().iter().map(|&x| x as i64));
            token_type_ids.extend(enc.get_type_ids().iter().map(|&x| x as i64));
        }

        let ids_arr = Array2::from_shape_vec((batch, seq_len), input_ids)
            .map_err(|e| SragError::BackendError(e.to_string()))?;
        let mask_arr = Array2::from_shape_vec((batch, seq_len), attention_mask.clone())
            .map_err(|e| SragError::BackendError(e.to_string()))?;
        let type_arr = Array2::from_shape_vec((batch, seq_len), token_type_ids)
            .map_err(|e| SragError::BackendError(e.to_string()))?;

        let ids_tensor = Tensor::from_array(ids_arr).map_err(|e| SragError::BackendError(e.to_string()))?;
        let mask_tensor =
            Tensor::from_array(mask_arr).map_err(|e| SragError::BackendError(e.to_string()))?;
        let type_tensor =
            Tensor::from_array(type_arr).map_err(|e| SragError::BackendError(e.to_string()))?;

        let input_names: Vec<String> = loaded.session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_name = loaded
            .session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .unwrap_or_else(|| "last_hidden_state".to_string());

        let outputs = if input_names.len() >= 3 {
            loaded
                .session
                .run(ort::inputs![
                    input_names[0].clone() => ids_tensor,
                    input_names[1].clone() => mask_tensor,
                    input_names[2].clone() => type_tensor,
                ])
                .map_err(|e| SragError::BackendError(e.to_string()))?
        } else {
            loaded
                .session
                .run(ort::inputs![
                    input_names[0].clone() => ids_tensor,
                    input_names[1].clone() => mask_tensor,
                ])
                .map_err(|e| SragError::BackendError(e.to_string()))?
        };

        let output = outputs
            .get(&output_name)
            .ok_or_else(|| SragError::BackendError(format!("no output '{output_name}' from model")))?;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| SragError::BackendError(e.to_string()))?;

        // Output is [batch, seq_len, hidden]; mean-pool over the sequence
        // dimension using the attention mask, matching BGE's recommended
        // pooling strategy.
        let hidden = shape[2] as usize;
        let mut vectors = Vec::with_capacity(batch);
        for b in 0..batch {
            let mut sum = vec![0f32; hidden];
            let mut count = 0f32;
            for t in 0..seq_len {
                if attention_mask[b * seq_len + t] == 0 {
                    continue;
                }
                let offset = (b * seq_len + t) * hidden;
                for h in 0..hidden {
                    sum[h] += data[offset + h];
                }
                count += 1.0;
            }
            if count > 0.0 {
                for v in sum.iter_mut() {
                    *v /= count;
                }
            }

            // L2-normalize, matching BGE's recommended embedding pooling.
            let norm = sum.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in sum.iter_mut() {
                    *v /= norm;
                }
            }
            vectors.push(sum);
        }

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unloaded_embedder_attempts_download_when_artifacts_missing() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = Embedder::with_urls(
            Some(dir.path().to_path_buf()),
            "http://127.0.0.1:1/model.onnx".to_string(),
            "http://127.0.0.1:1/tokenizer.json".to_string(),
        );
        assert!(!embedder.is_loaded().await);
        let err = embedder.load().await.unwrap_err();
        assert!(matches!(err, SragError::DownloadFailed { .. }));
    }

    #[tokio::test]
    async fn unload_is_safe_when_never_loaded() {
        let embedder = Embedder::new(None);
        embedder.unload().await;
        assert!(!embedder.is_loaded().await);
    }
}
