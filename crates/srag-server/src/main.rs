//! srag-ml — framed TCP sidecar exposing embedding, reranking, and text
//! generation to trusted local clients.

use clap::Parser;
use srag_core::config::{Provider, ServerConfig};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "srag-ml")]
#[command(about = "Local ML sidecar: embedding, rerank, and text generation over a framed TCP channel")]
struct Args {
    /// Host to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on (0 = OS-assigned).
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Write the assigned port to this file on startup; remove it on shutdown.
    #[arg(long)]
    port_file: Option<PathBuf>,

    /// Directory holding model artifacts. Defaults to `$XDG_DATA_HOME/srag/models`.
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Shared bearer token required on every request. Unset disables auth.
    #[arg(long)]
    auth_token: Option<String>,

    /// Local LLM filename under `--models-dir`.
    #[arg(long, default_value = "Llama-3.2-1B-Instruct-Q4_K_M.gguf")]
    model_filename: String,

    /// URL to fetch the local LLM from if absent.
    #[arg(
        long,
        default_value = "https://huggingface.co/bartowski/Llama-3.2-1B-Instruct-GGUF/resolve/main/Llama-3.2-1B-Instruct-Q4_K_M.gguf"
    )]
    model_url: String,

    /// Expected SHA-256 of the downloaded model file. Empty skips verification.
    #[arg(long, default_value = "")]
    model_sha256: String,

    /// llama.cpp thread count (0 = auto).
    #[arg(long, default_value_t = 0)]
    llm_threads: u32,

    /// llama.cpp context window size.
    #[arg(long, default_value_t = 4096)]
    llm_context_size: u32,

    /// Which backend serves `generate`: local, anthropic, or openai.
    #[arg(long, default_value = "local")]
    api_provider: String,

    /// Model name passed to the external provider.
    #[arg(long, default_value = "claude-sonnet-4-20250514")]
    api_model: String,

    /// Default `max_tokens` for external-provider generation.
    #[arg(long, default_value_t = 2048)]
    api_max_tokens: u32,

    /// Redact secrets from outbound prompts before they reach an external provider.
    #[arg(long, default_value_t = true)]
    redact_secrets: bool,

    /// File containing the external provider's API key.
    #[arg(long)]
    api_key_file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let api_provider = Provider::parse(&args.api_provider)
        .ok_or_else(|| anyhow::anyhow!("unknown --api-provider '{}'", args.api_provider))?;

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        port_file: args.port_file,
        models_dir: args.models_dir,
        auth_token: args.auth_token,
        model_filename: args.model_filename,
        model_url: args.model_url,
        model_sha256: args.model_sha256,
        llm_threads: args.llm_threads,
        llm_context_size: args.llm_context_size,
        api_provider,
        api_model: args.api_model,
        api_max_tokens: args.api_max_tokens,
        redact_secrets: args.redact_secrets,
        api_key: None,
        api_key_file: args.api_key_file,
    };

    info!("starting srag-ml");

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(srag_core::server::run(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
        }
        info!("shutdown signal received");
    }));

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("server exited with error: {e}");
            Err(e.into())
        }
    }
}
