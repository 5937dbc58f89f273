//! Model artifact resolution and checksum-verified download (C2).
//!
//! Underlies the embedder, reranker, and local LLM engine: none of them
//! know how to fetch a file, they just ask the store for a path that is
//! guaranteed to either exist and be fully downloaded, or not exist at
//! all. A `*.download` staging file is never treated as loadable.

use crate::error::{Result, SragError};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DOWNLOAD_SUFFIX: &str = ".download";
const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// `true` if `name` already exists (fully downloaded) under `dir`.
pub fn model_exists(dir: &Path, name: &str) -> bool {
    dir.join(name).is_file()
}

/// Stream `url` to `<name>.download` under `dir`, verify its SHA-256 if
/// `expected_sha256` is non-empty, then atomically rename it into place.
///
/// Returns the final path. On any failure after the staging file is
/// created, the staging file is removed before the error propagates.
pub async fn download(
    dir: &Path,
    name: &str,
    url: &str,
    expected_sha256: &str,
) -> Result<PathBuf> {
    let final_path = dir.join(name);
    if final_path.is_file() {
        return Ok(final_path);
    }

    std::fs::create_dir_all(dir).map_err(|e| SragError::io_with_path(e, dir))?;

    let staging_path = dir.join(format!("{name}{DOWNLOAD_SUFFIX}"));
    let result = stream_to_staging(url, &staging_path).await;

    if let Err(e) = result {
        let _ = std::fs::remove_file(&staging_path);
        return Err(e);
    }

    if !expected_sha256.is_empty() {
        let actual = hash_file(&staging_path)?;
        if !actual.eq_ignore_ascii_case(expected_sha256) {
            let _ = std::fs::remove_file(&staging_path);
            return Err(SragError::ChecksumMismatch {
                expected: expected_sha256.to_string(),
                actual,
            });
        }
    }

    std::fs::rename(&staging_path, &final_path).map_err(|e| {
        let _ = std::fs::remove_file(&staging_path);
        SragError::io_with_path(e, &final_path)
    })?;

    info!(model = name, url, "model artifact downloaded and verified");
    Ok(final_path)
}

async fn stream_to_staging(url: &str, staging_path: &Path) -> Result<()> {
    let client = reqwest::Client::builder()
        .user_agent("srag-ml/1.0")
        .build()
        .map_err(|e| SragError::DownloadFailed {
            url: url.to_string(),
            message: format!("failed to build http client: {e}"),
        })?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| SragError::DownloadFailed {
            url: url.to_string(),
            message: e.to_string(),
        })?;

    if !response.status().is_success() {
        return Err(SragError::DownloadFailed {
            url: url.to_string(),
            message: format!("unexpected status {}", response.status()),
        });
    }

    let total = response.content_length();
    let mut file = std::fs::File::create(staging_path)
        .map_err(|e| SragError::io_with_path(e, staging_path))?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let mut last_report = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| SragError::DownloadFailed {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        file.write_all(&chunk)
            .map_err(|e| SragError::io_with_path(e, staging_path))?;
        downloaded += chunk.len() as u64;

        // Coarse progress indicator on the diagnostic stream only (§4.2);
        // never sent over the RPC channel.
        if downloaded - last_report > 10 * 1024 * 1024 {
            match total {
                Some(t) if t > 0 => {
                    debug!(
                        "downloading {}: {:.1}%",
                        staging_path.display(),
                        downloaded as f64 / t as f64 * 100.0
                    );
                }
                _ => debug!("downloading {}: {} bytes", staging_path.display(), downloaded),
            }
            last_report = downloaded;
        }
    }

    file.flush().map_err(|e| SragError::io_with_path(e, staging_path))?;
    Ok(())
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| SragError::io_with_path(e, path))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        use std::io::Read;
        let n = file.read(&mut buf).map_err(|e| SragError::io_with_path(e, path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
