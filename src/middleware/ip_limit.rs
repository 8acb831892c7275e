//! Per-IP sliding-window limiter. This is abuse protection for the whole
//! API surface; the tenant-scoped upload quota is enforced separately at
//! the intake gate.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;

#[derive(Clone)]
pub struct IpRateLimiter {
    max_requests: u32,
    window: Duration,
    state: Arc<Mutex<HashMap<IpAddr, WindowEntry>>>,
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

enum Verdict {
    Allowed,
    Exceeded { retry_after: Duration },
}

impl IpRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self { max_requests, window, state: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn check(&self, ip: IpAddr) -> Verdict {
        let mut state = self.state.lock();
        let now = Instant::now();

        let entry =
            state.entry(ip).or_insert(WindowEntry { count: 0, window_start: now });
        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        if entry.count > self.max_requests {
            Verdict::Exceeded {
                retry_after: (entry.window_start + self.window).duration_since(now),
            }
        } else {
            Verdict::Allowed
        }
    }

    /// Drop windows nobody has touched lately; called from a background
    /// task so the map stays bounded.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window = self.window;
        state.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}

pub async fn ip_rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(limiter): State<IpRateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match limiter.check(addr.ip()) {
        Verdict::Allowed => next.run(request).await,
        Verdict::Exceeded { retry_after } => {
            warn!(ip = %addr.ip(), retry_after_secs = retry_after.as_secs(), "🛑 IP rate limited");
            let body = serde_json::json!({
                "status": "error",
                "error_code": "RATE_LIMIT_EXCEEDED",
                "message": "Too many requests from this address",
                "details": { "retry_after_seconds": retry_after.as_secs() },
                "timestamp": Utc::now().to_rfc3339(),
            });
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.as_secs().to_string())],
                axum::Json(body),
            )
                .into_response()
        }
    }
}
