use crate::classify;
use crate::config::Settings;
use crate::listener::ListenerFactory;
use crate::reconciler::Reconciler;
use crate::store::ConfigStore;
use crate::types::{ListenerEntry, SlotView};
use crate::watcher::ConfigWatcher;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub struct AppState {
    store: ConfigStore,
    listeners: watch::Receiver<Vec<ListenerEntry>>,
    trigger: Arc<Notify>,
    shutdown: Notify,
}

type SharedState = Arc<AppState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    pid: u32,
    config: String,
    managed: usize,
}

#[derive(Serialize)]
struct VersionResponse {
    version: String,
}

type ApiError = (StatusCode, Json<MessageResponse>);

fn api_err(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (
        status,
        Json(MessageResponse {
            message: msg.into(),
        }),
    )
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".into(),
        pid: std::process::id(),
        config: state.store.path().display().to_string(),
        managed: state.listeners.borrow().len(),
    })
}

async fn version_handler() -> impl IntoResponse {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn listeners(State(state): State<SharedState>) -> Json<Vec<ListenerEntry>> {
    Json(state.listeners.borrow().clone())
}

async fn slots(State(state): State<SharedState>) -> Result<Json<Vec<SlotView>>, ApiError> {
    let doc = state
        .store
        .load()
        .map_err(|e| api_err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(classify::slot_views(&doc)))
}

async fn reconcile(State(state): State<SharedState>) -> Json<MessageResponse> {
    state.trigger.notify_one();
    Json(MessageResponse {
        message: "Reconcile scheduled".into(),
    })
}

async fn shutdown_handler(State(state): State<SharedState>) -> Json<MessageResponse> {
    info!("Shutdown requested via API");
    state.shutdown.notify_one();
    Json(MessageResponse {
        message: "Shutting down".into(),
    })
}

// ---------------------------------------------------------------------------
// Server startup
// ---------------------------------------------------------------------------

/// Run the reconciler, config watcher and control API until shutdown.
pub async fn serve(port: u16, settings: Settings) -> Result<()> {
    let store = ConfigStore::new(settings.config_path.clone()).with_lock_settings(settings.lock.clone());
    let factory = ListenerFactory::new(settings.placeholder_dir.clone());
    let reconciler = Reconciler::new(store.clone(), factory, &settings);
    let trigger = Arc::new(Notify::new());

    let state = Arc::new(AppState {
        store,
        listeners: reconciler.subscribe(),
        trigger: trigger.clone(),
        shutdown: Notify::new(),
    });

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/version", get(version_handler))
        .route("/api/listeners", get(listeners))
        .route("/api/slots", get(slots))
        .route("/api/reconcile", post(reconcile))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .context("Failed to bind control port")?;

    let local_addr = listener.local_addr()?;
    // Print the actual address so tests can parse it when using port 0
    println!("Listening on {}", local_addr);

    info!(
        "Managing slots from {} (placeholders in {})",
        settings.config_path.display(),
        settings.placeholder_dir.display()
    );

    let watcher = ConfigWatcher::new(settings.config_path.clone(), settings.watch.clone(), trigger.clone()).start();

    let (stop_tx, stop_rx) = oneshot::channel();
    let reconcile_task = tokio::spawn(reconciler.run(trigger, stop_rx));

    // If the reconciler dies, its listeners drain on their own (their
    // shutdown senders drop); take the whole process down with it.
    let monitor_state = state.clone();
    let reconcile_task = tokio::spawn(async move {
        let result = reconcile_task.await;
        if let Err(e) = &result {
            error!("Reconciler stopped unexpectedly: {}", e);
        }
        monitor_state.shutdown.notify_one();
        result
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    drop(watcher);
    let _ = stop_tx.send(());
    let drain = settings.drain_timeout() + Duration::from_secs(1);
    match tokio::time::timeout(drain, reconcile_task).await {
        Ok(_) => info!("Server stopped"),
        Err(_) => warn!("Listeners did not close within {:?}; forcing exit", drain),
    }
    Ok(())
}

/// Wait for an API shutdown request, a reconciler failure, or an OS termination signal.
async fn shutdown_signal(state: SharedState) {
    let api = state.shutdown.notified();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                tokio::select! {
                    _ = api => info!("Graceful shutdown triggered"),
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
                }
                return;
            }
        };
        tokio::select! {
            _ = api => info!("Graceful shutdown triggered"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = api => info!("Graceful shutdown triggered"),
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
        }
    }
}
