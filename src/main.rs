// Main entry point for the shelf analysis service

use shelf_vision::{
    core::{
        types::{AggregateItem, GroupImageRequest, MultiImageRequest},
        Config, RequestError,
    },
    orchestration::BatchOrchestrator,
};

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<BatchOrchestrator>,
}

type HandlerError = (StatusCode, String);

fn request_error(e: RequestError) -> HandlerError {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("Request failed: {}", e);
    }
    (status, e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new()?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "shelf_vision={},ort=off",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== SHELF VISION ===");
    info!(
        "Config: credentials={} keys={} max_detections={} model={}",
        config.credential_pool_size(),
        config.api_keys().len(),
        config.detection.max_detections,
        config.api.model
    );
    if config.api_keys().is_empty() {
        tracing::warn!("No OPENAI_API_KEYS configured: every remote analysis will fail");
    }

    info!("Initializing batch orchestrator...");
    let orchestrator = Arc::new(BatchOrchestrator::new(config.clone()).await?);
    let state = AppState { orchestrator };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/health/credentials", get(health_credentials))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/analyze_group/", post(analyze_group))
        .route("/analyze_upload", post(analyze_upload))
        .route("/multi_image_ocr/", post(multi_image_ocr))
        .with_state(state)
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024)) // 50MB for high resolution shelf photos
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /                    - Root endpoint");
    info!("  GET  /health              - Health check");
    info!("  GET  /health/credentials  - Credential pool health");
    info!("  GET  /metrics             - Prometheus metrics");
    info!("  GET  /stats               - Detailed statistics");
    info!("  POST /analyze_group/      - Analyse a shelf photo (JSON data URL)");
    info!("  POST /analyze_upload      - Analyse a shelf photo (multipart/form-data)");
    info!("  POST /multi_image_ocr/    - One product from several photos");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn root() -> &'static str {
    "Shelf Vision - grocery shelf product analysis"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.orchestrator.backend_type(),
    }))
}

/// Credential pool health endpoint
async fn health_credentials(State(state): State<AppState>) -> Json<serde_json::Value> {
    let pool = state.orchestrator.credentials();
    let credentials = pool.stats();
    let healthy = pool.healthy_count();

    Json(serde_json::json!({
        "status": if healthy > 0 { "healthy" } else { "unhealthy" },
        "pool_size": pool.size(),
        "available": pool.available(),
        "in_use": pool.in_use(),
        "healthy_credentials": healthy,
        "circuit_breaker": state.orchestrator.circuit_breaker_stats(),
        "credentials": credentials,
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    state.orchestrator.metrics().record_endpoint_request("metrics");
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.orchestrator.metrics().to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(State(state): State<AppState>) -> Result<Json<serde_json::Value>, HandlerError> {
    let snapshot = state.orchestrator.metrics().snapshot();
    serde_json::to_value(snapshot).map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })
}

/// Analyse a shelf photo
///
/// # Request Format:
/// - JSON `{"image": "data:image/jpeg;base64,..."}`
///
/// # Response:
/// - One item per detection, in detection order
async fn analyze_group(
    State(state): State<AppState>,
    Json(request): Json<GroupImageRequest>,
) -> Result<Json<Vec<AggregateItem>>, HandlerError> {
    let start_time = std::time::Instant::now();
    state.orchestrator.metrics().record_endpoint_request("analyze_group");

    let items = state
        .orchestrator
        .analyze_group(&request.image)
        .await
        .map_err(request_error)?;

    log_completion(&items, start_time);
    Ok(Json(items))
}

/// Analyse an uploaded shelf photo
///
/// # Request Format:
/// - multipart/form-data with the file in field "image"
async fn analyze_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Vec<AggregateItem>>, HandlerError> {
    let start_time = std::time::Instant::now();
    state.orchestrator.metrics().record_endpoint_request("analyze_upload");

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        if field.name() == Some("image") {
            let data = field
                .bytes()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, format!("Read error: {}", e)))?;
            upload = Some(data.to_vec());
        }
    }

    let bytes = upload.ok_or_else(|| request_error(RequestError::NoImages))?;
    let items = state
        .orchestrator
        .analyze_upload(bytes)
        .await
        .map_err(request_error)?;

    log_completion(&items, start_time);
    Ok(Json(items))
}

/// Extract one product from several photos of it
///
/// # Request Format:
/// - JSON `{"images": ["<base64 or data URL>", ...]}`
async fn multi_image_ocr(
    State(state): State<AppState>,
    Json(request): Json<MultiImageRequest>,
) -> Result<Json<AggregateItem>, HandlerError> {
    state.orchestrator.metrics().record_endpoint_request("multi_image_ocr");

    let item = state
        .orchestrator
        .analyze_multi(&request.images)
        .await
        .map_err(request_error)?;
    Ok(Json(item))
}

fn log_completion(items: &[AggregateItem], start_time: std::time::Instant) {
    let failed = items.iter().filter(|item| item.is_error()).count();
    info!(
        "Request completed in {:.2}s: {} items, {} failed",
        start_time.elapsed().as_secs_f64(),
        items.len(),
        failed
    );
}
