//! Request logging middleware.
//!
//! One event per request: method, route template, status and latency.

use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{info, warn};

/// Logs every request except `/health`. 5xx at WARN, everything else at INFO.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path == "/health" {
        return next.run(request).await;
    }

    // Route template keeps vault symbols and user addresses out of the route field
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let start = Instant::now();
    let response = next.run(request).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(
            method = %method,
            route = %route,
            path = %path,
            status,
            latency_ms,
            "Request failed (5xx)"
        );
    } else {
        info!(
            method = %method,
            route = %route,
            path = %path,
            status,
            latency_ms,
            "Request completed"
        );
    }

    response
}
