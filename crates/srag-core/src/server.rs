//! Server core (C10): binds the listening socket, runs the accept loop, a
//! per-connection worker, and the idle-unload monitor.
//!
//! The accept loop races an external shutdown future against a timed
//! `accept()` via `tokio::select!` over a `watch` channel, spawning one
//! task per connection and dispatching each frame through the method
//! table in [`crate::handlers`].

use crate::config::{ProtocolConfig, ServerConfig};
use crate::embedder::Embedder;
use crate::error::{Result, SragError};
use crate::handlers::{self, Handles};
use crate::protocol::{read_frame, write_frame, Request, Response};
use crate::reranker::Reranker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[cfg(feature = "local-llm")]
use crate::llm_engine::LocalLlmEngine;

/// Everything the accept loop and connection workers share.
struct ServerState {
    handles: Handles,
    auth_token: Option<String>,
    running: AtomicBool,
}

/// Returns once the server has fully shut down (socket closed, port file
/// removed, models unloaded). Driven by an external `shutdown` future the
/// caller races against — typically a ctrl-c signal — alongside the
/// `shutdown` RPC, whichever comes first.
pub async fn run(config: ServerConfig, external_shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
    let models_dir = crate::config::resolve_models_dir(config.models_dir.as_deref())?;
    std::fs::create_dir_all(&models_dir).map_err(|e| SragError::io_with_path(e, &models_dir))?;

    let embedder = Embedder::new(Some(models_dir.clone()));
    let reranker = Reranker::new(Some(models_dir.clone()));

    #[cfg(feature = "local-llm")]
    let llm = if matches!(config.api_provider, crate::config::Provider::Local) {
        Some(LocalLlmEngine::new(&config, models_dir.clone())?)
    } else {
        None
    };

    let api_client = handlers::build_api_client(&config);

    let handles = Handles {
        embedder,
        reranker,
        #[cfg(feature = "local-llm")]
        llm,
        api_client,
        api_provider: config.api_provider,
        model_op_lock: tokio::sync::Mutex::new(()),
    };

    let state = Arc::new(ServerState {
        handles,
        auth_token: config.auth_token.clone(),
        running: AtomicBool::new(true),
    });

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .map_err(SragError::Io)?;
    let addr = listener.local_addr().map_err(SragError::Io)?;
    info!(%addr, "srag-ml listening");

    if let Some(port_file) = &config.port_file {
        if let Some(parent) = port_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SragError::io_with_path(e, parent))?;
        }
        std::fs::write(port_file, addr.port().to_string())
            .map_err(|e| SragError::io_with_path(e, port_file))?;
    }

    let (idle_shutdown_tx, idle_shutdown_rx) = watch::channel(false);
    #[cfg(feature = "local-llm")]
    let idle_monitor = tokio::spawn(idle_monitor_loop(state.clone(), idle_shutdown_rx));
    #[cfg(not(feature = "local-llm"))]
    let _ = idle_shutdown_rx;

    accept_loop(&listener, &state, external_shutdown).await;

    let _ = idle_shutdown_tx.send(true);
    #[cfg(feature = "local-llm")]
    idle_monitor.abort();

    state.handles.embedder.unload().await;
    state.handles.reranker.unload().await;
    #[cfg(feature = "local-llm")]
    if let Some(llm) = state.handles.llm.as_ref() {
        llm.unload().await;
    }

    if let Some(port_file) = &config.port_file {
        let _ = std::fs::remove_file(port_file);
    }

    info!("srag-ml shut down cleanly");
    Ok(())
}

async fn accept_loop(
    listener: &TcpListener,
    state: &Arc<ServerState>,
    external_shutdown: impl std::future::Future<Output = ()>,
) {
    tokio::pin!(external_shutdown);
    loop {
        if !state.running.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            _ = &mut external_shutdown => {
                state.running.store(false, Ordering::SeqCst);
                break;
            }
            accepted = tokio::time::timeout(ProtocolConfig::ACCEPT_POLL_INTERVAL, listener.accept()) => {
                match accepted {
                    Ok(Ok((stream, peer_addr))) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            debug!(%peer_addr, "connection accepted");
                            handle_connection(stream, &state).await;
                            debug!(%peer_addr, "connection closed");
                        });
                    }
                    Ok(Err(e)) => warn!("accept error: {e}"),
                    Err(_timeout) => continue,
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, state: &Arc<ServerState>) {
    let (mut reader, mut writer) = stream.split();

    loop {
        let frame = match tokio::time::timeout(ProtocolConfig::CONNECTION_RECV_TIMEOUT, read_frame(&mut reader)).await
        {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => return,
            Ok(Err(SragError::FrameTooLarge(len))) => {
                warn!(len, "frame too large, closing connection");
                return;
            }
            Ok(Err(_)) => return,
            Err(_timeout) => return,
        };

        let response = process_frame(&frame, state).await;
        let Ok(bytes) = serde_json::to_vec(&response) else {
            return;
        };
        if write_frame(&mut writer, &bytes).await.is_err() {
            return;
        }
    }
}

async fn process_frame(frame: &[u8], state: &Arc<ServerState>) -> Response {
    let request: Request = match serde_json::from_slice(frame) {
        Ok(req) => req,
        Err(e) => return Response::error(None, &SragError::ParseError(e.to_string())),
    };

    if let Some(expected) = &state.auth_token {
        let provided = request.auth.as_deref().unwrap_or("");
        if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            return Response::error(Some(request.id), &SragError::AuthFailed);
        }
    }

    match handlers::dispatch(&state.handles, &request.method, &request.params, &state.running).await {
        Ok(result) => Response::success(request.id, result),
        Err(e) => Response::error(Some(request.id), &e),
    }
}

/// Constant-time byte comparison for the shared bearer token. Mismatched
/// lengths short-circuit (the length of a bearer token isn't the secret
/// being protected here), equal lengths compare every byte regardless of
/// where the first mismatch occurs.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(feature = "local-llm")]
async fn idle_monitor_loop(state: Arc<ServerState>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(ProtocolConfig::IDLE_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown_rx.changed() => return,
        }

        let Some(llm) = state.handles.llm.as_ref() else { continue };
        if !llm.is_loaded().await {
            continue;
        }
        if llm.idle_seconds().await <= ProtocolConfig::IDLE_UNLOAD_THRESHOLD_SECS {
            continue;
        }

        // Acquire the same lock `generate` holds for its duration, so an
        // in-flight generation can never be torn out from under it (§5).
        let _guard = state.handles.model_op_lock.lock().await;
        if llm.is_loaded().await && llm.idle_seconds().await > ProtocolConfig::IDLE_UNLOAD_THRESHOLD_SECS {
            info!("unloading idle local llm");
            llm.unload().await;
        }
    }
}
