use std::{
    collections::HashMap,
    convert::Infallible,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    http::{header, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use futures::future::BoxFuture;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tower::{Layer, Service};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub uploads_per_minute: u64,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            uploads_per_minute: 120,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    state: Arc<RateLimitState>,
}

pub fn rate_limit_layer(config: RateLimitConfig) -> RateLimitLayer {
    RateLimitLayer {
        state: Arc::new(RateLimitState::new(config)),
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    state: Arc<RateLimitState>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let state = self.state.clone();

        Box::pin(async move {
            match state.check(&request).await {
                Ok(()) => inner.call(request).await,
                Err(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}

#[derive(Debug)]
struct RateLimitState {
    config: RateLimitConfig,
    counters: Mutex<HashMap<String, Counter>>,
}

impl RateLimitState {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn check<'a, B>(
        &'a self,
        request: &Request<B>,
    ) -> impl std::future::Future<Output = Result<(), RateLimitRejection>> + 'a {
        // Borrow the request only synchronously: extract everything the async
        // body needs as owned data so no `&Request` is held across the await
        // below (which would otherwise require `ReqBody: Sync`).
        let limited = is_limited(request.uri().path());
        let fingerprint = client_fingerprint(request);

        async move {
            if !limited {
                return Ok(());
            }

            let limit = self.config.uploads_per_minute;
            let window = self.config.window;
            if limit == 0 {
                return Err(RateLimitRejection::new(0, window, window));
            }

            let mut counters = self.counters.lock().await;
            let now = Instant::now();
            let entry = counters.entry(fingerprint.clone()).or_insert_with(|| Counter {
                window_start: now,
                count: 0,
            });

            let elapsed = now.saturating_duration_since(entry.window_start);
            if elapsed >= window {
                entry.window_start = now;
                entry.count = 0;
            }

            if entry.count >= limit {
                let retry_after = window
                    .checked_sub(elapsed)
                    .unwrap_or_default()
                    .max(Duration::from_secs(1));
                warn!(
                    identity_fingerprint = %fingerprint,
                    limit,
                    "upload rate limit exceeded"
                );
                return Err(RateLimitRejection::new(limit, window, retry_after));
            }

            entry.count += 1;
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
struct Counter {
    window_start: Instant,
    count: u64,
}

#[derive(Debug)]
struct RateLimitRejection {
    limit: u64,
    window: Duration,
    retry_after: Duration,
}

impl RateLimitRejection {
    fn new(limit: u64, window: Duration, retry_after: Duration) -> Self {
        Self {
            limit,
            window,
            retry_after,
        }
    }
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let retry_after_secs = self.retry_after.as_secs().max(1);
        let body = RateLimitBody {
            error: "rate_limit_exceeded",
            limit: self.limit,
            window_seconds: self.window.as_secs(),
            retry_after_seconds: retry_after_secs,
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
        response.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from_str(&retry_after_secs.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("1")),
        );
        response
    }
}

#[derive(Serialize)]
struct RateLimitBody {
    error: &'static str,
    limit: u64,
    window_seconds: u64,
    retry_after_seconds: u64,
}

fn is_limited(path: &str) -> bool {
    path.starts_with("/api/v1/store")
}

// Uploads carry no inbound credential, so the closest stable identity is the
// forwarded client address. Anything without one shares a single bucket.
fn client_fingerprint<B>(request: &Request<B>) -> String {
    let Some(value) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    else {
        return "anonymous".to_string();
    };

    let digest = Sha256::digest(value.as_bytes());
    STANDARD_NO_PAD.encode(digest)
}
