//! Request logging with a per-request id surfaced to handlers and clients.

use axum::{
    body::Body,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Request id attached to extensions and echoed in the `X-Request-Id`
/// response header.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub async fn request_logging_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let started = Instant::now();
    let mut response = next.run(request).await;
    let elapsed_ms = started.elapsed().as_millis();

    info!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms,
        request_id,
        "request"
    );

    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", value);
    }
    response
}
