//! Rate limiting middleware and the limited routes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{debug, warn};

use crate::ratelimit::{FixedWindowCounter, RateLimiterBackend, TokenBucket};

/// Body of a rejected request.
pub const RATE_LIMITED_BODY: &str = "Rate limit exceeded!\n";
/// Body of an admitted request on the limited routes.
pub const ADMITTED_BODY: &str = "You still have requests to spend!\n";

/// Key used when no client address can be determined.
const UNKNOWN_CLIENT: &str = "unknown";

/// Resolve the client key for a request.
///
/// Takes the first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer
/// address of the connection.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Admit or reject a request with the given limiter.
///
/// Exactly one decision call is made per request. A deny answers
/// `429 Too Many Requests` and the inner service is never reached.
pub async fn rate_limit(
    State(limiter): State<Arc<dyn RateLimiterBackend>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(request.headers(), peer);

    if limiter.check(&key).await.is_allowed() {
        debug!(key = %key, limiter = limiter.name(), "Request admitted");
        next.run(request).await
    } else {
        warn!(key = %key, limiter = limiter.name(), "Rate limit exceeded");
        (StatusCode::TOO_MANY_REQUESTS, RATE_LIMITED_BODY).into_response()
    }
}

async fn limited() -> &'static str {
    ADMITTED_BODY
}

async fn health() -> &'static str {
    "ok"
}

/// Build the application router.
///
/// `/tb/limited` is guarded by the token bucket, `/ftw/limited` by the
/// fixed-window counter; `/health` is never limited.
pub fn router(fixed_window: Arc<FixedWindowCounter>, token_bucket: Arc<TokenBucket>) -> Router {
    let fixed_window: Arc<dyn RateLimiterBackend> = fixed_window;
    let token_bucket: Arc<dyn RateLimiterBackend> = token_bucket;

    Router::new()
        .route(
            "/tb/limited",
            get(limited).layer(middleware::from_fn_with_state(token_bucket, rate_limit)),
        )
        .route(
            "/ftw/limited",
            get(limited).layer(middleware::from_fn_with_state(fixed_window, rate_limit)),
        )
        .route("/health", get(health))
}
