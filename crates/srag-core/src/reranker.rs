//! Lazy-loaded cross-encoder reranker (C4).
//!
//! Same session/tokenizer lifecycle as the embedder (C3), but each
//! inference pairs the query against one candidate document and produces
//! a single relevance score rather than a vector.

use crate::config::ModelDefaults;
use crate::error::{Result, SragError};
use crate::model_store;
use ndarray::Array2;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::PathBuf;
use tokenizers::Tokenizer;
use tokio::sync::Mutex;
use tracing::{debug, info};

struct Loaded {
    session: Session,
    tokenizer: Tokenizer,
}

/// Lazy-loaded MS MARCO MiniLM cross-encoder reranker.
pub struct Reranker {
    cache_dir: Option<PathBuf>,
    model_url: String,
    tokenizer_url: String,
    inner: Mutex<Option<Loaded>>,
}

impl Reranker {
    /// Uses the canonical model/tokenizer download URLs (§4.3).
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self::with_urls(
            cache_dir,
            ModelDefaults::RERANKER_MODEL_URL.to_string(),
            ModelDefaults::RERANKER_TOKENIZER_URL.to_string(),
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

    pub async fn load(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let model_dir = self
            .cache_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let model_path = model_dir.join(ModelDefaults::RERANKER_FILENAME);
        let tokenizer_path = model_dir.join(ModelDefaults::RERANKER_TOKENIZER_FILENAME);

        if !model_path.is_file() {
            model_store::download(&model_dir, ModelDefaults::RERANKER_FILENAME, &self.model_url, "").await?;
        }
        if !tokenizer_path.is_file() {
            model_store::download(
                &model_dir,
                ModelDefaults::RERANKER_TOKENIZER_FILENAME,
                &self.tokenizer_url,
                "",
            )
            .await?;
        }

        debug!(path = %model_path.display(), "loading reranker session");

        let session = Session::builder()
            .map_err(|e| SragError::BackendError(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| SragError::BackendError(e.to_string()))?
            .commit_from_file(&model_path)
            .map_err(|e| SragError::BackendError(e.to_string()))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| SragError::BackendError(e.to_string()))?;

        *guard = Some(Loaded { session, tokenizer });
        info!(model = ModelDefaults::RERANKER_NAME, "reranker loaded");
        Ok(())
    }

    pub async fn unload(&self) {
        *self.inner.lock().await = None;
    }

    /// Score every `(query, doc)` pair and return the `top_k` highest,
    /// sorted by score descending, ties broken by ascending original
    /// index. `top_k` larger than `docs.len()` clamps silently.
    pub async fn rerank(
        &self,
        query: &str,
        docs: &[String],
        top_k: usize,
    ) -> Result<Vec<(usize, f32)>> {
        self.load().await?;
        let guard = self.inner.lock().await;
        let loaded = guard
            .as_ref()
            .ok_or_else(|| SragError::BackendError("reranker not loaded".to_string()))?;

        let pairs: Vec<(String, String)> =
            docs.iter().map(|d| (query.to_string(), d.clone())).collect();
        let encodings = loaded
            .tokenizer
            .encode_batch(pairs, true)
            .map_err(|e| SragError::BackendError(format!("tokenization failed: {e}")))?;

        let batch = encodings.len();
        let seq_len = encodings.iter().map(|e| e.get_ids().len()).max().unwrap_or(0);

        let mut input_ids = vec![0i64; batch * seq_len];
        let mut attention_mask = vec![0i64; batch * seq_len];
        for (b, enc) in encodings.iter().enumerate() {
            for (t, &id) in enc.get_ids().iter().enumerate() {
                input_ids[b * seq_len + t] = id as i64;
                attention_mask[b * seq_len + t] = 1;
            }
        }

        let ids_arr = Array2::from_shape_vec((batch, seq_len), input_ids)
            .map_err(|e| SragError::BackendError(e.to_string()))?;
        let mask_arr = Array2::from_shape_vec((batch, seq_len), attention_mask)
            .map_err(|e| SragError::BackendError(e.to_string()))?;

        let ids_tensor = Tensor::from_array(ids_arr).map_err(|e| SragError::BackendError(e.to_string()))?;
        let mask_tensor =
            Tensor::from_array(mask_arr).map_err(|e| SragError::BackendError(e.to_string()))?;

        let input_names: Vec<String> = loaded.session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_name = loaded
            .session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .unwrap_or_else(|| "logits".to_string());

        let outputs = loaded
            .session
            .run(ort::inputs![
                input_names[0].clone() => ids_tensor,
                input_names[1].clone() => mask_tensor,
            ])
            .map_err(|e| SragError::BackendError(e.to_string()))?;

        let output = outputs
            .get(&output_name)
            .ok_or_else(|| SragError::BackendError(format!("no output '{output_name}' from model")))?;
        let (_shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| SragError::BackendError(e.to_string()))?;

        let mut scored: Vec<(usize, f32)> = data.iter().copied().enumerate().take(batch).collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let k = top_k.min(scored.len());
        Ok(scored.into_iter().take(k).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unloaded_reranker_attempts_download_when_artifacts_missing() {
        let dir = tempfile::tempdir().unwrap();
        let reranker = Reranker::with_urls(
            Some(dir.path().to_path_buf()),
            "http://127.0.0.1:1/model.onnx".to_string(),
            "http://127.0.0.1:1/tokenizer.json".to_string(),
        );
        assert!(!reranker.is_loaded().await);
        let err = reranker.load().await.unwrap_err();
        assert!(matches!(err, SragError::DownloadFailed { .. }));
    }

    #[test]
    fn top_k_ordering_is_descending_with_index_tiebreak() {
        let mut scored = vec![(0usize, 0.5f32), (1, 0.9), (2, 0.5), (3, 0.1)];
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        assert_eq!(scored, vec![(1, 0.9), (0, 0.5), (2, 0.5), (3, 0.1)]);
    }
}
