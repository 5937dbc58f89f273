//! Error types for the srag ML sidecar.
//!
//! These map directly onto the error kinds in the dispatcher's taxonomy:
//! every variant knows its own JSON-RPC error code, so the connection
//! worker never has to duplicate that mapping.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the srag library.
#[derive(Debug, Error)]
pub enum SragError {
    /// Malformed JSON in a frame payload.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Missing or wrong `auth` field when an auth token is configured.
    #[error("authentication failed")]
    AuthFailed,

    /// Request validation failure (§4.8).
    #[error("{0}")]
    BadArgs(String),

    /// Unknown or unsupported `api_provider` value.
    #[error("unknown provider: {0}")]
    BadProvider(String),

    /// External API client has no usable API key.
    #[error("{0}")]
    NotConfigured(String),

    /// Local LLM has no resolvable model and no download is possible.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Download of a model artifact failed.
    #[error("download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    /// Downloaded artifact did not match its expected SHA-256.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The underlying inference/encoder runtime raised an error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// Frame declared a length exceeding the maximum; connection is closed.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Connection-ending I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SragError>;

impl From<serde_json::Error> for SragError {
    fn from(err: serde_json::Error) -> Self {
        SragError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for SragError {
    fn from(err: reqwest::Error) -> Self {
        SragError::BackendError(err.to_string())
    }
}

impl SragError {
    /// Map to the JSON-RPC error code the wire protocol exposes (§6.2, §7).
    ///
    /// The reference surface only distinguishes parse errors and auth
    /// failures from everything else; all other failures share `-32603`.
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            SragError::ParseError(_) => -32700,
            SragError::AuthFailed => -32600,
            _ => -32603,
        }
    }

    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        SragError::Io(std::io::Error::new(
            err.kind(),
            format!("{} (path: {})", err, path.display()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_maps_to_32700() {
        assert_eq!(SragError::ParseError("x".into()).to_rpc_error_code(), -32700);
    }

    #[test]
    fn auth_failed_maps_to_32600() {
        assert_eq!(SragError::AuthFailed.to_rpc_error_code(), -32600);
    }

    #[test]
    fn everything_else_maps_to_32603() {
        assert_eq!(
            SragError::BadArgs("bad".into()).to_rpc_error_code(),
            -32603
        );
        assert_eq!(
            SragError::ModelUnavailable("x".into()).to_rpc_error_code(),
            -32603
        );
        assert_eq!(SragError::FrameTooLarge(99).to_rpc_error_code(), -32603);
    }
}
