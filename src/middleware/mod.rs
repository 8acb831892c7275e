//! HTTP middleware: request logging and per-IP abuse protection in front of
//! the tenant-level repository rate limit.

pub mod ip_limit;
pub mod logging;

pub use ip_limit::{ip_rate_limit_middleware, IpRateLimiter};
pub use logging::request_logging_middleware;
