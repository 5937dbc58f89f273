//! Local causal-LM engine (C5): owns one loaded llama.cpp instance,
//! tracks last use for the idle monitor (§5), and exposes single-turn
//! chat generation.
//!
//! The `LlamaContext` borrows from its `LlamaModel` for the model's own
//! lifetime, but we store both behind the same lock and never outlive the
//! model, so erasing the borrow to `'static` is sound — this is the one
//! FFI boundary in the crate that needs it.

#![allow(unsafe_code)]

use crate::config::ServerConfig;
use crate::error::{Result, SragError};
use crate::model_store;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{LlamaModel, Special};
use llama_cpp_2::token::data_array::LlamaTokenDataArray;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of a single `generate` call.
pub struct GenerateResult {
    pub text: String,
    pub tokens_used: u64,
}

struct Loaded {
    model: Arc<LlamaModel>,
    // SAFETY: erased from `LlamaContext<'a>` tied to `model`'s borrow.
    // `model` is never dropped while this context is alive; both live
    // inside the same `Loaded` and are torn down together.
    context: LlamaContext<'static>,
    model_path: PathBuf,
}

unsafe impl Send for Loaded {}

struct State {
    loaded: Option<Loaded>,
    last_used_ts: Option<u64>,
}

/// Lazily-loaded local LLM, guarded by the server's global model mutex at
/// the call site (§5) — this struct's own mutex only protects the
/// `Option<Loaded>` slot itself, not cross-handler exclusivity.
pub struct LocalLlmEngine {
    backend: LlamaBackend,
    models_dir: PathBuf,
    model_filename: String,
    model_url: String,
    model_sha256: String,
    context_size: u32,
    thread_hint: u32,
    state: Mutex<State>,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl LocalLlmEngine {
    pub fn new(config: &ServerConfig, models_dir: PathBuf) -> Result<Self> {
        let backend = LlamaBackend::init()
            .map_err(|e| SragError::BackendError(format!("failed to init llama backend: {e}")))?;
        Ok(Self {
            backend,
            models_dir,
            model_filename: config.model_filename.clone(),
            model_url: config.model_url.clone(),
            model_sha256: config.model_sha256.clone(),
            context_size: config.llm_context_size,
            thread_hint: config.llm_threads,
            state: Mutex::new(State {
                loaded: None,
                last_used_ts: None,
            }),
        })
    }

    pub async fn is_loaded(&self) -> bool {
        self.state.lock().await.loaded.is_some()
    }

    pub async fn idle_seconds(&self) -> u64 {
        let state = self.state.lock().await;
        match state.last_used_ts {
            Some(ts) => now_unix().saturating_sub(ts),
            None => 0,
        }
    }

    /// Fixed heuristic, not a live measurement: llama.cpp gives no cheap way
    /// to attribute resident memory to just this model, so the original
    /// source approximates a loaded 1B-class GGUF model at a flat 1500 MB
    /// rather than instrument the process. `None` while unloaded.
    pub async fn memory_estimate_mb(&self) -> Option<u64> {
        self.is_loaded().await.then_some(1500)
    }

    /// Load the model at `path` (or the configured default), downloading
    /// it via the model store if absent. Idempotent: if already loaded,
    /// just refreshes `last_used_ts`.
    pub async fn load(&self, path: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.loaded.is_some() {
            state.last_used_ts = Some(now_unix());
            return Ok(());
        }

        let model_path = match path {
            Some(p) => PathBuf::from(p),
            None => self.models_dir.join(&self.model_filename),
        };

        if !model_path.is_file() {
            if self.model_url.is_empty() {
                return Err(SragError::ModelUnavailable(format!(
                    "no model at {} and no download URL configured",
                    model_path.display()
                )));
            }
            model_store::download(
                &self.models_dir,
                &self.model_filename,
                &self.model_url,
                &self.model_sha256,
            )
            .await?;
        }

        debug!(path = %model_path.display(), "loading local llm");

        let model_params = LlamaModelParams::default();
        let model = LlamaModel::load_from_file(&self.backend, &model_path, &model_params)
            .map_err(|e| SragError::BackendError(format!("failed to load model: {e}")))?;
        let model = Arc::new(model);

        let n_ctx = if self.context_size == 0 {
            None
        } else {
            NonZeroU32::new(self.context_size)
        };
        let mut ctx_params = LlamaContextParams::default().with_n_ctx(n_ctx);
        if self.thread_hint > 0 {
            ctx_params = ctx_params.with_n_threads(self.thread_hint as i32);
        }

        let context = model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| SragError::BackendError(format!("failed to create context: {e}")))?;

        state.loaded = Some(Loaded {
            model,
            // SAFETY: see `Loaded` doc comment.
            context: unsafe { std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(context) },
            model_path: model_path.clone(),
        });
        state.last_used_ts = Some(now_unix());

        info!(path = %model_path.display(), "local llm loaded");
        Ok(())
    }

    pub async fn unload(&self) {
        let mut state = self.state.lock().await;
        state.loaded = None;
    }

    /// Generate a single assistant turn for `prompt`. Ensures the model
    /// is loaded, refreshes `last_used_ts`, and returns the generated
    /// text with the total token count consumed (prompt + completion).
    pub async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        stop: &[String],
    ) -> Result<GenerateResult> {
        self.load(None).await?;

        let mut state = self.state.lock().await;
        state.last_used_ts = Some(now_unix());
        let loaded = state
            .loaded
            .as_mut()
            .ok_or_else(|| SragError::BackendError("local llm not loaded".to_string()))?;

        let _ = temperature; // llama-cpp-2 0.1.x exposes only greedy sampling here.

        let tokens = loaded
            .model
            .str_to_token(prompt, llama_cpp_2::model::AddBos::Always)
            .map_err(|e| SragError::BackendError(format!("tokenization failed: {e}")))?;

        let context_size = self.context_size.max(1) as usize;
        if tokens.len() > context_size {
            return Err(SragError::BackendError(format!(
                "prompt too long: {} tokens exceeds context size {}",
                tokens.len(),
                context_size
            )));
        }

        let batch_size = 512usize;
        let mut batch = LlamaBatch::new(batch_size, 1);
        let num_prompt_tokens = tokens.len();
        let mut pos = 0usize;

        while pos < num_prompt_tokens {
            batch.clear();
            let chunk_end = (pos + batch_size).min(num_prompt_tokens);
            let is_last_chunk = chunk_end == num_prompt_tokens;
            for (idx, &token) in tokens[pos..chunk_end].iter().enumerate() {
                let token_pos = pos + idx;
                let needs_logits = is_last_chunk && token_pos == num_prompt_tokens - 1;
                batch
                    .add(token, token_pos as i32, &[0], needs_logits)
                    .map_err(|e| SragError::BackendError(format!("batch add failed: {e}")))?;
            }
            loaded
                .context
                .decode(&mut batch)
                .map_err(|e| SragError::BackendError(format!("decode failed: {e}")))?;
            pos = chunk_end;
        }

        let mut generated = String::new();
        let mut current_pos = num_prompt_tokens;
        let mut n_generated: u64 = 0;
        let max_tokens = max_tokens.max(1) as usize;

        for _ in 0..max_tokens {
            let logits = loaded.context.candidates_ith(batch.n_tokens() - 1);
            let mut candidates = LlamaTokenDataArray::from_iter(logits, false);
            let token = candidates.sample_token_greedy();

            if token == loaded.model.token_eos() {
                break;
            }

            let piece = loaded
                .model
                .token_to_str(token, Special::Plaintext)
                .map_err(|e| SragError::BackendError(format!("detokenize failed: {e}")))?;
            generated.push_str(&piece);
            n_generated += 1;

            if !stop.is_empty() {
                if let Some(hit) = stop.iter().find(|s| !s.is_empty() && generated.contains(s.as_str())) {
                    if let Some(idx) = generated.find(hit.as_str()) {
                        generated.truncate(idx);
                    }
                    break;
                }
            }

            batch.clear();
            if let Err(e) = batch.add(token, current_pos as i32, &[0], true) {
                warn!("failed to extend batch: {e}");
                break;
            }
            if let Err(e) = loaded.context.decode(&mut batch) {
                warn!("decode failed mid-generation: {e}");
                break;
            }
            current_pos += 1;
        }

        Ok(GenerateResult {
            text: generated,
            tokens_used: num_prompt_tokens as u64 + n_generated,
        })
    }

    pub async fn model_path(&self) -> Option<PathBuf> {
        self.state.lock().await.loaded.as_ref().map(|l| l.model_path.clone())
    }
}
