//! Request handling for one managed port.

use crate::types::{HealthPayload, ListenerEntry, ServeMode};
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Extensions served with a long-lived cache header. Everything else is `no-cache`.
const CACHEABLE_EXTENSIONS: &[&str] = &[
    "js", "mjs", "css", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff", "woff2", "ttf",
    "map",
];

const LONG_CACHE: &str = "public, max-age=3600, immutable";
const NO_CACHE: &str = "no-cache";

/// Builds the router for a listener entry.
#[derive(Debug, Clone)]
pub struct ListenerFactory {
    placeholder_dir: PathBuf,
}

struct ListenerState {
    entry: ListenerEntry,
    /// Placeholder asset directory or static root; `None` for a static slot
    /// with no root configured.
    root: Option<PathBuf>,
}

type SharedState = Arc<ListenerState>;

impl ListenerFactory {
    pub fn new(placeholder_dir: PathBuf) -> Self {
        Self { placeholder_dir }
    }

    /// Asset directory for a slot's placeholder page.
    pub fn placeholder_assets(&self, slot: &str) -> PathBuf {
        self.placeholder_dir.join(slot)
    }

    pub fn build(&self, entry: &ListenerEntry) -> Router {
        let root = match &entry.mode {
            ServeMode::Static { static_root, .. } => {
                match static_root {
                    Some(root) if root.is_dir() => {}
                    Some(root) => warn!(
                        "Static root missing for slot {}: {}; port {} will return 404",
                        entry.slot,
                        root.display(),
                        entry.port
                    ),
                    None => warn!(
                        "No static root configured for slot {}; port {} will return 404",
                        entry.slot, entry.port
                    ),
                }
                static_root.clone()
            }
            _ => Some(self.placeholder_assets(&entry.slot)),
        };

        let state = Arc::new(ListenerState {
            entry: entry.clone(),
            root,
        });

        Router::new()
            .route("/health", get(health))
            .fallback(serve_assets)
            .with_state(state)
            .layer(CompressionLayer::new())
            .layer(TraceLayer::new_for_http())
    }
}

async fn health(State(state): State<SharedState>) -> Json<HealthPayload> {
    Json(HealthPayload {
        status: "healthy".into(),
        slot: state.entry.slot.clone(),
        port: state.entry.port,
        mode: state.entry.mode.name().into(),
        timestamp: Utc::now(),
    })
}

async fn serve_assets(State(state): State<SharedState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            format!("{} not allowed", method),
        )
            .into_response();
    }
    match state.entry.mode {
        ServeMode::Static { spa, .. } => serve_static(&state, &uri, spa).await,
        _ => serve_placeholder(&state, &uri).await,
    }
}

async fn serve_placeholder(state: &ListenerState, uri: &Uri) -> Response {
    let Some(dir) = state.root.as_deref() else {
        return not_found();
    };

    if let Some(file) = resolve_file(dir, uri.path()) {
        if let Ok(resp) = send_file(&file, NO_CACHE).await {
            return resp;
        }
    }

    let index = dir.join("index.html");
    match send_file(&index, NO_CACHE).await {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::NOT_FOUND,
            format!(
                "Placeholder assets not found for slot \"{}\" at {}",
                state.entry.slot,
                dir.display()
            ),
        )
            .into_response(),
    }
}

async fn serve_static(state: &ListenerState, uri: &Uri, spa: bool) -> Response {
    let Some(root) = state.root.as_deref() else {
        return not_found();
    };

    if let Some(file) = resolve_file(root, uri.path()) {
        if let Ok(resp) = send_file(&file, cache_control_for(&file)).await {
            return resp;
        }
    }

    if spa {
        if let Ok(resp) = send_file(&root.join("index.html"), NO_CACHE).await {
            return resp;
        }
    }
    not_found()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// Map a request path onto an existing file under `root`.
///
/// Directories resolve to their `index.html`. `..` and dotfile segments never
/// resolve.
pub fn resolve_file(root: &Path, request_path: &str) -> Option<PathBuf> {
    let decoded = percent_decode_str(request_path).decode_utf8().ok()?;
    let mut path = root.to_path_buf();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            s if s.starts_with('.') || s.contains('\\') || s.contains('\0') => return None,
            s => path.push(s),
        }
    }
    if path.is_dir() {
        path.push("index.html");
    }
    path.is_file().then_some(path)
}

pub fn cache_control_for(path: &Path) -> &'static str {
    let cacheable = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| CACHEABLE_EXTENSIONS.contains(&ext.as_str()));
    if cacheable {
        LONG_CACHE
    } else {
        NO_CACHE
    }
}

async fn send_file(path: &Path, cache_control: &'static str) -> std::io::Result<Response> {
    let body = tokio::fs::read(path).await?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, mime.essence_str().to_string()),
            (CACHE_CONTROL, cache_control.to_string()),
        ],
        body,
    )
        .into_response())
}
