use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, instrument};

use crate::config;
use crate::error::StampError;
use crate::metadata::GeoCoordinate;
use crate::pipeline::{self, PhotoPipeline, PhotoTask};
use crate::resolver::ResolverHandle;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub cfg: config::SharedConfig,
    pub resolver: Arc<ResolverHandle>,
    pub tasks: Arc<tokio::sync::RwLock<HashMap<String, PhotoTask>>>,
}

#[derive(Deserialize)]
pub struct LocationQuery {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Serialize)]
pub struct TaskSummary {
    pub filename: String,
    pub status: crate::pipeline::TaskStatus,
    pub error: Option<String>,
    pub suggested_filename: Option<String>,
}

impl TaskSummary {
    fn from_task(task: &PhotoTask) -> Self {
        Self {
            filename: task.filename.clone(),
            status: task.status,
            error: task.error_message.clone(),
            suggested_filename: task.suggested_filename.clone(),
        }
    }
}

// Logs all 4xx/5xx responses with method, URI, status and latency.
async fn log_error_responses(req: axum::extract::Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let res = next.run(req).await;
    let status = res.status();
    if status.is_server_error() {
        tracing::error!(%method, %uri, %status, elapsed_ms = start.elapsed().as_millis(), "http 5xx");
    } else if status.is_client_error() {
        tracing::warn!(%method, %uri, %status, elapsed_ms = start.elapsed().as_millis(), "http 4xx");
    }
    res
}

pub async fn get_config(State(state): State<AppState>) -> Result<Json<config::Config>, StatusCode> {
    config::ConfigManager::to_struct(&state.cfg)
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Resolve a coordinate to its display string through the cached resolver.
/// Mirrors the external `/location` contract: `{"location": ...}` on
/// success, `{"error": ...}` with a 4xx/5xx status otherwise.
pub async fn get_location(
    State(state): State<AppState>,
    Query(query): Query<LocationQuery>,
) -> Response {
    // 0 doubles as the parse-failure sentinel at this boundary, so it is
    // rejected along with non-finite values.
    if !query.lat.is_finite() || !query.lng.is_finite() || query.lat == 0.0 || query.lng == 0.0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "緯度または経度が無効です。" })),
        )
            .into_response();
    }
    let resolver = state.resolver.current().await;
    let coordinate = GeoCoordinate {
        latitude: query.lat,
        longitude: query.lng,
    };
    match resolver.resolve(coordinate).await {
        Ok(location) => (StatusCode::OK, Json(json!({ "location": location }))).into_response(),
        Err(StampError::ResolutionFailed(message)) => {
            let status = if message == "場所を特定できませんでした。" {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(json!({ "error": message }))).into_response()
        }
        Err(other) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": other.to_string() })),
        )
            .into_response(),
    }
}

/// Accept a multipart batch of photos, run one pipeline per new file, and
/// report the terminal state of each.
pub async fn upload_photos(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Vec<TaskSummary>>, StatusCode> {
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        let Some(filename) = field.file_name().map(|s| s.to_string()) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|_| StatusCode::BAD_REQUEST)?
            .to_vec();
        files.push((filename, bytes));
    }
    if files.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let seen: HashSet<String> = { state.tasks.read().await.keys().cloned().collect() };
    let fresh = pipeline::dedup_by_filename(&seen, files);
    tracing::info!(accepted = fresh.len(), "starting photo batch");

    let resolver = state.resolver.current().await;
    let pipeline = Arc::new(PhotoPipeline::new(resolver));
    let tasks = pipeline::run_batch(pipeline, fresh).await;

    let summaries: Vec<TaskSummary> = tasks.iter().map(TaskSummary::from_task).collect();
    {
        let mut store = state.tasks.write().await;
        for task in tasks {
            store.insert(task.filename.clone(), task);
        }
    }
    Ok(Json(summaries))
}

pub async fn list_photos(State(state): State<AppState>) -> Json<Vec<TaskSummary>> {
    let store = state.tasks.read().await;
    let mut summaries: Vec<TaskSummary> = store.values().map(TaskSummary::from_task).collect();
    summaries.sort_by(|a, b| a.filename.cmp(&b.filename));
    Json(summaries)
}

/// Download one stamped result. 404 until the task reached `ready`.
pub async fn get_photo_image(
    Path(filename): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, StatusCode> {
    let store = state.tasks.read().await;
    let task = store.get(&filename).ok_or(StatusCode::NOT_FOUND)?;
    let result = task.result.as_ref().ok_or(StatusCode::NOT_FOUND)?;
    let download_name = task
        .suggested_filename
        .clone()
        .unwrap_or_else(|| "stamped-photo.jpg".to_string());
    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{download_name}\""),
            ),
        ],
        result.bytes.clone(),
    )
        .into_response())
}

/// Discard every task and its results.
pub async fn clear_photos(State(state): State<AppState>) -> StatusCode {
    state.tasks.write().await.clear();
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
pub struct CredentialsPayload {
    pub api_key: String,
}

#[instrument(err, skip_all)]
pub async fn set_location_credentials(
    State(state): State<AppState>,
    Json(payload): Json<CredentialsPayload>,
) -> Result<StatusCode, StatusCode> {
    config::ConfigManager::set_google_api_key(&state.cfg, &payload.api_key)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    config::ConfigManager::save(&state.cfg)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    // Rebuild the resolver so the new key takes effect immediately.
    let cfg = config::ConfigManager::to_struct(&state.cfg)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    state
        .resolver
        .rebuild(&cfg.location.unwrap_or_default())
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(StatusCode::OK)
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::ERROR));

    // Build API router and mount it under /api
    let api = Router::new()
        .route("/config", get(get_config))
        .route("/location", get(get_location))
        .route("/location/credentials", post(set_location_credentials))
        .route(
            "/photos",
            post(upload_photos)
                .layer(DefaultBodyLimit::disable())
                .get(list_photos)
                .delete(clear_photos),
        )
        .route("/photos/{filename}/image", get(get_photo_image))
        .with_state(state.clone())
        .layer(cors)
        .layer(trace)
        .layer(middleware::from_fn(log_error_responses));

    Router::new().nest("/api", api)
}

/// Serve the HTTP API. If `bind` is Some it is parsed as a socket address, otherwise
/// defaults to 0.0.0.0:8080.
pub async fn serve(app: Router, bind: Option<String>) -> anyhow::Result<()> {
    let bind_addr = bind.unwrap_or_else(|| "0.0.0.0:8080".to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    tracing::info!(addr=%addr, "starting http server");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
