// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! The indexer's HTTP surface: thin handlers delegating to [`Store`],
//! [`Index`], and [`Dispatcher`]. Every route accepts an optional
//! `delay=<duration>` query parameter (a testing aid) that sleeps before
//! the handler does any real work.

use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use crate::dispatcher::Dispatcher;
use crate::error::{IndexError, StoreError};
use crate::index::{Index, SortField, SortOrder};
use crate::store::Store;
use crate::upload::receive_upload;
use crate::wire::chrono_compat::Timestamp;
use crate::wire::{Coredump, Uid};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub index: Arc<dyn Index>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<crate::metrics::Metrics>,
    pub indexer_version: &'static str,
}

pub fn router(state: AppState, assets_dir: std::path::PathBuf) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/about", get(about))
        .route("/cores", post(upload).get(search))
        .route(
            "/cores/:uid",
            get(get_core).delete(delete_core),
        )
        .route("/cores/:uid/_analyze", post(reanalyze))
        .route(
            "/executables/:hash",
            get(get_executable).head(head_executable),
        )
        .route("/metrics", get(metrics))
        .nest_service("/assets", tower_http::services::ServeDir::new(assets_dir))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize, Default)]
struct DelayOnly {
    delay: Option<String>,
}

async fn apply_delay(delay: &Option<String>) {
    if let Some(raw) = delay {
        if let Ok(d) = humantime::parse_duration(raw) {
            tokio::time::sleep(d).await;
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(ErrorBody { error: message.to_string() })).into_response()
}

async fn index_page() -> impl IntoResponse {
    axum::response::Html(include_str!("../assets/index.html"))
}

async fn about() -> impl IntoResponse {
    Json(crate::buildcfg::about())
}

#[axum_macros::debug_handler]
async fn upload(State(state): State<AppState>, Query(q): Query<DelayOnly>, body: Body) -> Response {
    apply_delay(&q.delay).await;
    let stream = body.into_data_stream();
    match receive_upload(state.store.clone(), stream, state.indexer_version.to_string()).await {
        Ok(outcome) => {
            state.metrics.core_size_bytes.observe(outcome.coredump.core_size as f64);
            state
                .metrics
                .executable_size_bytes
                .observe(outcome.coredump.executable_size as f64);
            if let Err(e) = state.index.index(outcome.coredump).await {
                state.metrics.upload_errors_total.inc();
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"));
            }
            state.metrics.uploads_total.inc();
            state.dispatcher.enqueue_analysis(outcome.uid);
            StatusCode::OK.into_response()
        }
        Err(e) => {
            state.metrics.upload_errors_total.inc();
            tracing::warn!("upload failed: {e:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default = "default_query")]
    q: String,
    #[serde(default = "default_sort")]
    sort: String,
    #[serde(default = "default_order")]
    order: String,
    #[serde(default = "default_size")]
    size: usize,
    #[serde(default)]
    from: usize,
    delay: Option<String>,
}

fn default_query() -> String {
    "*".to_string()
}
fn default_sort() -> String {
    "dumped_at".to_string()
}
fn default_order() -> String {
    "desc".to_string()
}
fn default_size() -> usize {
    50
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<Coredump>,
    total: usize,
}

#[axum_macros::debug_handler]
async fn search(State(state): State<AppState>, Query(q): Query<SearchQuery>) -> Response {
    apply_delay(&q.delay).await;
    let sort_field = match q.sort.as_str() {
        "dumped_at" => SortField::DumpedAt,
        "hostname" => SortField::Hostname,
        other => return error_response(StatusCode::BAD_REQUEST, format!("invalid sort field {other:?}")),
    };
    let sort_order = match q.order.as_str() {
        "asc" => SortOrder::Asc,
        "desc" => SortOrder::Desc,
        other => return error_response(StatusCode::BAD_REQUEST, format!("invalid sort order {other:?}")),
    };
    match state.index.search(&q.q, sort_field, sort_order, q.size, q.from).await {
        Ok(page) => Json(SearchResponse { results: page.results, total: page.total }).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

async fn get_core(
    State(state): State<AppState>,
    AxumPath(uid): AxumPath<String>,
    Query(q): Query<DelayOnly>,
) -> Response {
    apply_delay(&q.delay).await;
    let uid = match Uid::from_hex(&uid) {
        Ok(uid) => uid,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    stream_file(state.store.get_core(uid).await, "application/octet-stream").await
}

async fn delete_core(
    State(state): State<AppState>,
    AxumPath(uid): AxumPath<String>,
    Query(q): Query<DelayOnly>,
) -> Response {
    apply_delay(&q.delay).await;
    let uid = match Uid::from_hex(&uid) {
        Ok(uid) => uid,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    match state.index.find(uid).await {
        Ok(_) => {
            state.dispatcher.enqueue_cleanup(uid);
            StatusCode::OK.into_response()
        }
        Err(IndexError::NotFound) => error_response(StatusCode::BAD_REQUEST, "unknown core"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

async fn reanalyze(
    State(state): State<AppState>,
    AxumPath(uid): AxumPath<String>,
    Query(q): Query<DelayOnly>,
) -> Response {
    apply_delay(&q.delay).await;
    let uid = match Uid::from_hex(&uid) {
        Ok(uid) => uid,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    match state.index.find(uid).await {
        Ok(_) => {
            state.dispatcher.enqueue_analysis(uid);
            StatusCode::ACCEPTED.into_response()
        }
        Err(IndexError::NotFound) => error_response(StatusCode::BAD_REQUEST, "unknown core"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

async fn head_executable(
    State(state): State<AppState>,
    AxumPath(hash): AxumPath<String>,
    Query(q): Query<DelayOnly>,
) -> StatusCode {
    apply_delay(&q.delay).await;
    if state.store.has_executable(&hash).await {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn get_executable(
    State(state): State<AppState>,
    AxumPath(hash): AxumPath<String>,
    Query(q): Query<DelayOnly>,
) -> Response {
    apply_delay(&q.delay).await;
    stream_file(state.store.get_executable(&hash).await, "application/octet-stream").await
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

/// Streams an open file with `Content-Length`/`Last-Modified`. A missing
/// core/executable resolves to 404; any other store error (a genuine I/O
/// failure) is a 500.
async fn stream_file(
    file: Result<tokio::fs::File, StoreError>,
    content_type: &'static str,
) -> Response {
    let file = match file {
        Ok(f) => f,
        Err(StoreError::NotFound) => return StatusCode::NOT_FOUND.into_response(),
        Err(e @ StoreError::Io(_)) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e}"))
        }
    };
    let metadata = match file.metadata().await {
        Ok(m) => m,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e}")),
    };
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_LENGTH, metadata.len().into());
    headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
    if let Ok(modified) = metadata.modified() {
        let secs = modified
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as i64;
        if let Ok(value) = Timestamp::from_unix_seconds(secs).to_http_date().parse() {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    let body = Body::from_stream(ReaderStream::new(file));
    (headers, body).into_response()
}
