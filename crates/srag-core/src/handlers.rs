//! RPC method dispatch (C9) and generation routing (C7).
//!
//! One function per method in §4.8's table, plus [`dispatch`] which looks
//! the method up and runs validation before calling it. The router (C7) has
//! no state of its own — it's just the branch inside [`generate`] that picks
//! the local engine or the external client based on server configuration.

use crate::config::{ModelDefaults, Provider, ServerConfig};
use crate::embedder::Embedder;
use crate::error::{Result, SragError};
use crate::reranker::Reranker;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;

#[cfg(feature = "local-llm")]
use crate::llm_engine::LocalLlmEngine;

use crate::api_client::ExternalApiClient;

/// Shared model handles a connection worker dispatches against. Held
/// behind the server's single model mutex for the handlers that touch it
/// (§5); `ping`/`model_status`/`shutdown` never acquire it.
pub struct Handles {
    pub embedder: Embedder,
    pub reranker: Reranker,
    #[cfg(feature = "local-llm")]
    pub llm: Option<LocalLlmEngine>,
    pub api_client: Option<ExternalApiClient>,
    pub api_provider: Provider,
    /// Held for the duration of any handler that touches a model handle
    /// (embed, generate, rerank, load_model, unload_model) — not the
    /// per-component locks inside `Embedder`/`Reranker`/`LocalLlmEngine`
    /// themselves, which only protect their own `Option<Loaded>` slot.
    /// `ping`, `model_status`, and `shutdown` never acquire this (§5).
    pub model_op_lock: tokio::sync::Mutex<()>,
}

fn get_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn get_str_array(params: &Value, key: &str) -> Option<Vec<String>> {
    params.get(key)?.as_array().map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

pub async fn ping() -> Result<Value> {
    Ok(json!({"status": "ok"}))
}

pub async fn embed(handles: &Handles, params: &Value) -> Result<Value> {
    let Some(texts) = get_str_array(params, "texts") else {
        return Err(SragError::BadArgs("texts must be an array of strings".to_string()));
    };
    if texts.is_empty() {
        return Err(SragError::BadArgs("texts must not be empty".to_string()));
    }
    if texts.len() > 64 {
        return Err(SragError::BadArgs("texts must not exceed 64 items".to_string()));
    }

    let vectors = handles.embedder.embed(&texts).await?;
    Ok(json!({"vectors": vectors}))
}

pub async fn rerank(handles: &Handles, params: &Value) -> Result<Value> {
    let query = get_str(params, "query").unwrap_or("");
    if query.is_empty() {
        return Err(SragError::BadArgs("query must not be empty".to_string()));
    }

    let documents = get_str_array(params, "documents").unwrap_or_default();
    if documents.is_empty() {
        return Err(SragError::BadArgs("documents must not be empty".to_string()));
    }

    let top_k = params
        .get("top_k")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(10);

    let results = handles.reranker.rerank(query, &documents, top_k).await?;
    let results: Vec<Value> = results
        .into_iter()
        .map(|(idx, score)| json!([idx, score]))
        .collect();
    Ok(json!({"results": results}))
}

/// Coerce `max_tokens` to 1024 when absent, non-numeric, or out of
/// `[1, 32768]`; coerce `temperature` to 0.1 under the same rule over
/// `[0.0, 2.0]` (§4.8).
fn coerce_max_tokens(params: &Value) -> u32 {
    params
        .get("max_tokens")
        .and_then(Value::as_u64)
        .filter(|&n| (1..=32768).contains(&n))
        .map(|n| n as u32)
        .unwrap_or(1024)
}

fn coerce_temperature(params: &Value) -> f32 {
    params
        .get("temperature")
        .and_then(Value::as_f64)
        .filter(|&t| (0.0..=2.0).contains(&t))
        .map(|t| t as f32)
        .unwrap_or(0.1)
}

pub async fn generate(handles: &Handles, params: &Value) -> Result<Value> {
    let prompt = get_str(params, "prompt").unwrap_or("");
    if prompt.is_empty() {
        return Err(SragError::BadArgs("prompt must not be empty".to_string()));
    }

    let max_tokens = coerce_max_tokens(params);
    let temperature = coerce_temperature(params);
    let stop = get_str_array(params, "stop").unwrap_or_default();

    let (text, tokens_used) = match handles.api_provider {
        #[cfg(feature = "local-llm")]
        Provider::Local => {
            let llm = handles
                .llm
                .as_ref()
                .ok_or_else(|| SragError::ModelUnavailable("local LLM not configured".to_string()))?;
            let result = llm.generate(prompt, max_tokens, temperature, &stop).await?;
            (result.text, result.tokens_used)
        }
        #[cfg(not(feature = "local-llm"))]
        Provider::Local => {
            return Err(SragError::ModelUnavailable(
                "local LLM support was not compiled into this build".to_string(),
            ))
        }
        Provider::Anthropic | Provider::Openai => {
            let client = handles
                .api_client
                .as_ref()
                .ok_or_else(|| SragError::NotConfigured("external API client not configured".to_string()))?;
            let result = client
                .generate(prompt, Some(max_tokens), temperature, Some(&stop))
                .await?;
            (result.text, result.tokens_used)
        }
    };

    Ok(json!({"text": text, "tokens_used": tokens_used}))
}

pub async fn load_model(handles: &Handles, params: &Value) -> Result<Value> {
    match get_str(params, "type") {
        Some("embedder") => {
            handles.embedder.load().await?;
        }
        Some("llm") => {
            if !matches!(handles.api_provider, Provider::Local) {
                return Err(SragError::BadArgs("Local LLM not available".to_string()));
            }
            #[cfg(feature = "local-llm")]
            {
                let llm = handles
                    .llm
                    .as_ref()
                    .ok_or_else(|| SragError::BadArgs("Local LLM not available".to_string()))?;
                let path = get_str(params, "path");
                llm.load(path).await?;
            }
            #[cfg(not(feature = "local-llm"))]
            {
                return Err(SragError::BadArgs("Local LLM not available".to_string()));
            }
        }
        Some(_) | None => return Err(SragError::BadArgs("Unknown model type".to_string())),
    }
    Ok(json!({"status": "loaded"}))
}

pub async fn unload_model(handles: &Handles, params: &Value) -> Result<Value> {
    match get_str(params, "type") {
        Some("embedder") => handles.embedder.unload().await,
        Some("llm") => {
            #[cfg(feature = "local-llm")]
            if let Some(llm) = handles.llm.as_ref() {
                llm.unload().await;
            }
        }
        Some(_) | None => return Err(SragError::BadArgs("Unknown model type".to_string())),
    }
    Ok(json!({"status": "unloaded"}))
}

pub async fn model_status(handles: &Handles) -> Result<Value> {
    let embedder_loaded = handles.embedder.is_loaded().await;
    let reranker_loaded = handles.reranker.is_loaded().await;

    #[cfg(feature = "local-llm")]
    let (llm_loaded, process_memory_mb) = match handles.llm.as_ref() {
        Some(llm) => (llm.is_loaded().await, llm.memory_estimate_mb().await),
        None => (false, None),
    };
    #[cfg(not(feature = "local-llm"))]
    let (llm_loaded, process_memory_mb): (bool, Option<u64>) = (false, None);

    let api_redactions = handles.api_client.as_ref().map(|c| c.total_redactions()).unwrap_or(0);

    let mut status = json!({
        "embedder_loaded": embedder_loaded,
        "llm_loaded": llm_loaded,
        "reranker_loaded": reranker_loaded,
        "api_provider": handles.api_provider.as_str(),
        "api_redactions": api_redactions,
    });

    let obj = status.as_object_mut().expect("status is always an object");
    if embedder_loaded {
        obj.insert("embedder_memory_mb".to_string(), json!(ModelDefaults::EMBEDDER_MEMORY_MB));
    }
    if reranker_loaded {
        obj.insert("reranker_memory_mb".to_string(), json!(ModelDefaults::RERANKER_MEMORY_MB));
    }
    if let Some(mb) = process_memory_mb {
        obj.insert("process_memory_mb".to_string(), json!(mb));
    }

    Ok(status)
}

/// Route one request's `method` to its handler. Unknown methods fail
/// `BadArgs("Unknown method")` (§4.8).
pub async fn dispatch(
    handles: &Handles,
    method: &str,
    params: &Value,
    running: &std::sync::atomic::AtomicBool,
) -> Result<Value> {
    match method {
        "ping" => ping().await,
        "model_status" => model_status(handles).await,
        "shutdown" => {
            running.store(false, Ordering::SeqCst);
            Ok(json!({"status": "shutting_down"}))
        }
        "embed" => {
            let _guard = handles.model_op_lock.lock().await;
            embed(handles, params).await
        }
        "generate" => {
            let _guard = handles.model_op_lock.lock().await;
            generate(handles, params).await
        }
        "rerank" => {
            let _guard = handles.model_op_lock.lock().await;
            rerank(handles, params).await
        }
        "load_model" => {
            let _guard = handles.model_op_lock.lock().await;
            load_model(handles, params).await
        }
        "unload_model" => {
            let _guard = handles.model_op_lock.lock().await;
            unload_model(handles, params).await
        }
        _ => Err(SragError::BadArgs("Unknown method".to_string())),
    }
}

/// Build the external API client from server configuration, or `None` when
/// the provider is `local` (nothing to construct) (§4.5, §4.6).
pub fn build_api_client(config: &ServerConfig) -> Option<ExternalApiClient> {
    if matches!(config.api_provider, Provider::Local) {
        return None;
    }
    Some(ExternalApiClient::new(crate::api_client::ApiClientConfig {
        provider: config.api_provider,
        model: config.api_model.clone(),
        api_key: config.api_key.clone(),
        api_key_file: config.api_key_file.clone(),
        max_tokens: config.api_max_tokens,
        redact_secrets: config.redact_secrets,
        base_url: None,
    }))
}
