//! Centralized configuration for the srag ML sidecar.
//!
//! Mirrors the CLI surface in §6.1: every field here has a corresponding
//! `--flag` parsed by the `srag-server` binary. The defaults live here, not
//! in the binary, so library consumers (tests, embedders) get the same
//! behavior without going through `clap`.

use std::path::PathBuf;
use std::time::Duration;

/// Which backend serves the `generate` RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Local,
    Anthropic,
    Openai,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Local => "local",
            Provider::Anthropic => "anthropic",
            Provider::Openai => "openai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Some(Provider::Local),
            "anthropic" => Some(Provider::Anthropic),
            "openai" => Some(Provider::Openai),
            _ => None,
        }
    }
}

impl Default for Provider {
    fn default() -> Self {
        Provider::Local
    }
}

/// Wire protocol limits and timing (§4.7, §4.9, §5).
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Maximum frame payload size before the connection is closed (§4.7).
    pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;
    /// Accept-loop poll interval so shutdown is observed promptly (§4.9).
    pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
    /// Per-connection receive timeout (§4.9).
    pub const CONNECTION_RECV_TIMEOUT: Duration = Duration::from_secs(30);
    /// Idle monitor wake interval (§5).
    pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Idle seconds after which the local LLM is unloaded (§5).
    pub const IDLE_UNLOAD_THRESHOLD_SECS: u64 = 300;
}

/// Model identity constants (§4.3).
pub struct ModelDefaults;

impl ModelDefaults {
    pub const EMBEDDER_NAME: &'static str = "BAAI/bge-small-en-v1.5";
    pub const EMBEDDER_DIM: usize = 384;
    pub const EMBEDDER_FILENAME: &'static str = "bge-small-en-v1.5.onnx";
    pub const EMBEDDER_TOKENIZER_FILENAME: &'static str = "bge-small-en-v1.5_tokenizer.json";
    pub const EMBEDDER_MODEL_URL: &'static str =
        "https://huggingface.co/BAAI/bge-small-en-v1.5/resolve/main/onnx/model.onnx";
    pub const EMBEDDER_TOKENIZER_URL: &'static str =
        "https://huggingface.co/BAAI/bge-small-en-v1.5/resolve/main/tokenizer.json";

    pub const RERANKER_NAME: &'static str = "Xenova/ms-marco-MiniLM-L-6-v2";
    pub const RERANKER_FILENAME: &'static str = "ms-marco-MiniLM-L-6-v2.onnx";
    pub const RERANKER_TOKENIZER_FILENAME: &'static str = "ms-marco-MiniLM-L-6-v2_tokenizer.json";
    pub const RERANKER_MODEL_URL: &'static str =
        "https://huggingface.co/Xenova/ms-marco-MiniLM-L-6-v2/resolve/main/onnx/model.onnx";
    pub const RERANKER_TOKENIZER_URL: &'static str =
        "https://huggingface.co/Xenova/ms-marco-MiniLM-L-6-v2/resolve/main/tokenizer.json";

    /// Fixed memory heuristics for `model_status` (§4.8).
    pub const EMBEDDER_MEMORY_MB: u64 = 90;
    pub const RERANKER_MEMORY_MB: u64 = 100;
}

/// Launch-time configuration (§6.1). Constructed by the binary from
/// parsed CLI arguments; every field has the documented default.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub port_file: Option<PathBuf>,
    pub models_dir: Option<PathBuf>,
    pub auth_token: Option<String>,
    pub model_filename: String,
    pub model_url: String,
    pub model_sha256: String,
    pub llm_threads: u32,
    pub llm_context_size: u32,
    pub api_provider: Provider,
    pub api_model: String,
    pub api_max_tokens: u32,
    pub redact_secrets: bool,
    pub api_key: Option<String>,
    pub api_key_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            port_file: None,
            models_dir: None,
            auth_token: None,
            model_filename: "model.gguf".to_string(),
            model_url: String::new(),
            model_sha256: String::new(),
            llm_threads: 0,
            llm_context_size: 4096,
            api_provider: Provider::Local,
            api_model: "claude-sonnet-4-20250514".to_string(),
            api_max_tokens: 2048,
            redact_secrets: true,
            api_key: None,
            api_key_file: None,
        }
    }
}

/// Resolve the models directory per §4.2: caller-provided path, else
/// `$XDG_DATA_HOME/srag/models`, else `~/.local/share/srag/models`.
pub fn resolve_models_dir(explicit: Option<&std::path::Path>) -> crate::error::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }

    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return Ok(PathBuf::from(xdg).join("srag").join("models"));
        }
    }

    let home = dirs::home_dir().ok_or_else(|| {
        crate::error::SragError::Config("could not determine home directory".to_string())
    })?;
    Ok(home.join(".local").join("share").join("srag").join("models"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_roundtrip() {
        for p in [Provider::Local, Provider::Anthropic, Provider::Openai] {
            assert_eq!(Provider::parse(p.as_str()), Some(p));
        }
        assert_eq!(Provider::parse("bogus"), None);
    }

    #[test]
    fn default_server_config_matches_spec_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.llm_context_size, 4096);
        assert_eq!(cfg.api_max_tokens, 2048);
        assert!(cfg.redact_secrets);
        assert_eq!(cfg.api_provider, Provider::Local);
    }

    #[test]
    fn resolve_models_dir_respects_explicit_path() {
        let dir = resolve_models_dir(Some(std::path::Path::new("/tmp/explicit"))).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/explicit"));
    }
}
