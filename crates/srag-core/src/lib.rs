//! srag-core — headless library for the srag ML sidecar.
//!
//! Exposes the pieces a `srag-server` binary wires together: a secret
//! redaction filter, a checksum-verified model artifact store, lazy-loaded
//! embedding/reranking/local-LLM engines, an external generation API
//! client, the RPC dispatcher, and the TCP server core that ties them all
//! together behind one wire protocol.
//!
//! # Example
//!
//! ```rust,no_run
//! use srag_core::config::ServerConfig;
//!
//! #[tokio::main]
//! async fn main() -> srag_core::error::Result<()> {
//!     let config = ServerConfig::default();
//!     srag_core::server::run(config, std::future::pending()).await
//! }
//! ```

pub mod api_client;
pub mod config;
pub mod embedder;
pub mod error;
pub mod handlers;
#[cfg(feature = "local-llm")]
pub mod llm_engine;
pub mod model_store;
pub mod protocol;
pub mod reranker;
pub mod secret_filter;
pub mod server;

pub use config::{Provider, ServerConfig};
pub use embedder::Embedder;
pub use error::{Result, SragError};
pub use reranker::Reranker;

#[cfg(feature = "local-llm")]
pub use llm_engine::LocalLlmEngine;
