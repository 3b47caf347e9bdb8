use std::{
    env,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::middleware::rate_limit::{rate_limit_layer, RateLimitConfig};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use blob_store::{Access, BlobStore, HttpBlobStore, PutOptions};
use serde::Serialize;
use serde_json::Value;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use url::Url;
use utoipa::{OpenApi, ToSchema};

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_UPLOADS_PER_MINUTE: u64 = 120;

const MISSING_FIELDS_MESSAGE: &str = "Missing fields: filename, content_type, data_base64";
const MISSING_TOKEN_MESSAGE: &str = "BLOB_STORE_TOKEN is not configured";

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let store = HttpBlobStore::new(config.store_endpoint.clone())
        .context("initializing blob store client")?;

    let rate_limit = RateLimitConfig {
        uploads_per_minute: config.uploads_per_minute,
        ..RateLimitConfig::default()
    };
    let cors = cors_layer(&config.allowed_origins);
    let listen_addr = config.listen_addr;

    let state = Arc::new(AppState {
        store: Arc::new(store),
        config,
    });

    let mut app = build_router(state)
        .layer(rate_limit_layer(rate_limit))
        .layer(TraceLayer::new_for_http());
    if let Some(cors) = cors {
        app = app.layer(cors);
    }

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %listen_addr, "relay-daemon listening");
    axum::serve(listener, app)
        .await
        .context("HTTP server exited")?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route(
            "/api/v1/store",
            post(store_blob).fallback(method_not_allowed),
        )
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn BlobStore>,
    config: AppConfig,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    store_endpoint: Url,
    store_token: Option<String>,
    store_timeout: Duration,
    allowed_origins: Vec<String>,
    uploads_per_minute: u64,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("RELAY_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid RELAY_API_ADDR")?;

        let store_endpoint = env::var("BLOB_STORE_ENDPOINT")
            .context("BLOB_STORE_ENDPOINT must be configured")?
            .parse()
            .context("invalid BLOB_STORE_ENDPOINT")?;

        // The token stays optional at startup; its absence is surfaced per
        // request so the daemon can come up before credentials are rotated in.
        let store_token = env::var("BLOB_STORE_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let store_timeout = env::var("RELAY_STORE_TIMEOUT_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_STORE_TIMEOUT);

        let allowed_origins = parse_string_list_env("RELAY_ALLOWED_ORIGINS").unwrap_or_default();

        let uploads_per_minute = env::var("RELAY_UPLOADS_PER_MINUTE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_UPLOADS_PER_MINUTE);

        Ok(Self {
            listen_addr,
            store_endpoint,
            store_token,
            store_timeout,
            allowed_origins,
            uploads_per_minute,
        })
    }
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring malformed entry in RELAY_ALLOWED_ORIGINS");
                None
            }
        })
        .collect();
    if parsed.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods([Method::POST])
            .allow_headers([header::CONTENT_TYPE]),
    )
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses((status = 200, description = "Prometheus metrics", content_type = "text/plain"))
)]
async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, "# metrics placeholder\nrelay_daemon_up 1\n")
}

async fn method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, HeaderValue::from_static("POST"))],
        "Method Not Allowed",
    )
}

#[utoipa::path(
    post,
    path = "/api/v1/store",
    request_body = StoreRequest,
    responses(
        (status = 200, description = "Object stored", body = StoreResponse),
        (status = 400, description = "Required fields missing", body = ErrorBody),
        (status = 405, description = "Only POST is accepted"),
        (status = 500, description = "Missing configuration or upstream failure", body = ErrorBody)
    )
)]
async fn store_blob(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<StoreResponse>, ApiError> {
    let started = Instant::now();

    let token = state
        .config
        .store_token
        .as_deref()
        .ok_or_else(|| ApiError::internal(MISSING_TOKEN_MESSAGE))?;

    let request = parse_store_request(&body)?;
    let data = STANDARD
        .decode(request.data_base64.as_bytes())
        .map_err(ApiError::internal)?;

    let options = PutOptions {
        access: Access::Public,
        content_type: Some(request.content_type),
        add_random_suffix: true,
    };

    let put = state.store.put(&request.filename, data, &options, token);
    let stored = match tokio::time::timeout(state.config.store_timeout, put).await {
        Ok(Ok(stored)) => stored,
        Ok(Err(err)) => {
            error!(
                duration_ms = started.elapsed().as_millis() as u64,
                filename = %request.filename,
                %err,
                "blob upload failed"
            );
            return Err(ApiError::internal(err));
        }
        Err(_) => {
            error!(
                duration_ms = started.elapsed().as_millis() as u64,
                filename = %request.filename,
                "blob upload timed out"
            );
            return Err(ApiError::internal(format!(
                "put() timeout after {}s",
                state.config.store_timeout.as_secs()
            )));
        }
    };

    info!(
        duration_ms = started.elapsed().as_millis() as u64,
        url = %stored.url,
        "blob stored"
    );
    Ok(Json(StoreResponse { url: stored.url }))
}

fn parse_store_request(body: &[u8]) -> Result<StoreRequest, ApiError> {
    // An empty raw body counts as an empty object; any syntactically valid
    // JSON is accepted here and left to the field check below.
    let value: Value = if body.is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(body).map_err(ApiError::internal)?
    };

    match (
        non_empty_field(&value, "filename"),
        non_empty_field(&value, "content_type"),
        non_empty_field(&value, "data_base64"),
    ) {
        (Some(filename), Some(content_type), Some(data_base64)) => Ok(StoreRequest {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            data_base64: data_base64.to_string(),
        }),
        _ => Err(ApiError::bad_request(MISSING_FIELDS_MESSAGE)),
    }
}

fn non_empty_field<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

fn parse_string_list_env(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|value| {
        value
            .split(',')
            .filter_map(|item| {
                let trimmed = item.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
            .collect::<Vec<_>>()
    })
}

#[derive(Debug, ToSchema)]
struct StoreRequest {
    filename: String,
    content_type: String,
    data_base64: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct StoreResponse {
    url: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

pub mod docs {
    use super::*;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Upload Relay API", version = "0.1.0"),
        paths(healthz, metrics, store_blob),
        components(schemas(StoreRequest, StoreResponse, ErrorBody))
    )]
    pub struct ApiDoc;
}
