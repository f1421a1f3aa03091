//! Axum observer surface for pagewatch: state queries, snapshot and diff
//! retrieval, the activity log, and cycle start/cancel control.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pw_core::FingerprintRecord;
use pw_engine::WatchEngine;
use serde::Serialize;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "pw-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WatchEngine>,
}

impl AppState {
    pub fn new(engine: Arc<WatchEngine>) -> Self {
        Self { engine }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/state", get(state_handler))
        .route("/logs", get(logs_handler))
        .route("/identifiers/{id}/snapshots", get(snapshots_handler))
        .route("/identifiers/{id}/markup", get(markup_handler))
        .route("/identifiers/{id}/diff", get(diff_handler))
        .route("/cycle/start", post(cycle_start_handler))
        .route("/cycle/cancel", post(cycle_cancel_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(engine: Arc<WatchEngine>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("PAGEWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.state_view().await {
        Ok(view) => {
            let mut rows = String::new();
            for identifier in view.settings.normalized_identifiers() {
                let record = view.records.get(&identifier).cloned().unwrap_or_default();
                let (icon, status_text) = match &record.last_status {
                    Some(status) if status.ok && status.changed => ("*", "changed"),
                    Some(status) if status.ok => ("-", "unchanged"),
                    Some(status) if status.is_inconclusive() => ("?", "no content yet"),
                    Some(_) => ("x", "failed"),
                    None => ("-", "not checked"),
                };
                let checked_at = record
                    .last_check_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                let note = record
                    .last_status
                    .map(|status| status.note)
                    .unwrap_or_default();
                rows.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td><td>{} {}</td><td>{}</td></tr>\n",
                    esc(&identifier),
                    esc(&checked_at),
                    icon,
                    status_text,
                    esc(&note)
                ));
            }
            Html(format!(
                concat!(
                    "<!doctype html><html><head><title>pagewatch</title></head><body>",
                    "<h1>pagewatch</h1>",
                    "<p>scheduler: {:?}, interval: {} min, polling: {}</p>",
                    "<table border=\"1\"><tr><th>identifier</th><th>last check</th>",
                    "<th>status</th><th>note</th></tr>\n{}</table>",
                    "</body></html>"
                ),
                view.status,
                view.settings.interval_minutes(),
                view.settings.polling_enabled,
                rows
            ))
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn state_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.state_view().await {
        Ok(view) => Json(view).into_response(),
        Err(err) => server_error(err),
    }
}

async fn logs_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.activity_entries()).into_response()
}

#[derive(Debug, Serialize)]
struct SnapshotPair {
    identifier: String,
    last: String,
    prev: String,
}

async fn snapshots_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.engine.record(&id).await {
        Ok(record) => Json(SnapshotPair {
            identifier: id,
            last: record.last_snapshot_text,
            prev: record.prev_snapshot_text,
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn markup_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.engine.record(&id).await {
        Ok(record) => Json(SnapshotPair {
            identifier: id,
            last: record.last_snapshot_markup,
            prev: record.prev_snapshot_markup,
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn diff_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.engine.record(&id).await {
        Ok(record) => {
            let FingerprintRecord {
                prev_snapshot_text,
                last_snapshot_text,
                ..
            } = record;
            Json(diff_lines(&prev_snapshot_text, &last_snapshot_text)).into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    ok: bool,
    status: pw_engine::SchedulerStatus,
}

async fn cycle_start_handler(State(state): State<Arc<AppState>>) -> Response {
    let engine = Arc::clone(&state.engine);
    // Single-flight lives in the engine: starting while a cycle runs is a
    // silent no-op there.
    tokio::spawn(async move {
        if let Err(err) = engine.run_cycle().await {
            tracing::warn!(error = %err, "requested poll cycle failed");
        }
    });
    Json(ControlResponse {
        ok: true,
        status: state.engine.status(),
    })
    .into_response()
}

async fn cycle_cancel_handler(State(state): State<Arc<AppState>>) -> Response {
    state.engine.request_cancel();
    Json(ControlResponse {
        ok: true,
        status: state.engine.status(),
    })
    .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn esc(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    Context,
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffLine {
    pub kind: DiffKind,
    pub text: String,
}

/// Line-pairwise diff of the previous snapshot against the latest one.
/// Deliberately simple: the sanitizer preserves line breaks precisely so this
/// view stays cheap and predictable.
pub fn diff_lines(prev: &str, last: &str) -> Vec<DiffLine> {
    let old: Vec<&str> = prev.split('\n').map(|l| l.trim_end_matches('\r')).collect();
    let new: Vec<&str> = last.split('\n').map(|l| l.trim_end_matches('\r')).collect();
    let max = old.len().max(new.len());

    let mut out = Vec::with_capacity(max);
    for i in 0..max {
        let l = old.get(i).copied().unwrap_or("");
        let r = new.get(i).copied().unwrap_or("");
        if l == r {
            out.push(DiffLine {
                kind: DiffKind::Context,
                text: l.to_string(),
            });
        } else {
            if !r.is_empty() {
                out.push(DiffLine {
                    kind: DiffKind::Added,
                    text: r.to_string(),
                });
            }
            if !l.is_empty() {
                out.push(DiffLine {
                    kind: DiffKind::Removed,
                    text: l.to_string(),
                });
            }
        }
    }
    out
}
