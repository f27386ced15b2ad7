//! HTTP surface: the rate limit middleware, the admin API and the server.

pub mod admin;
mod middleware;
mod response;
mod server;

pub use admin::{AdminState, ADMIN_PREFIX};
pub use middleware::{
    apply_rate_limit_headers, RateLimitLayer, RateLimitMiddleware, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET, X_RATELIMIT_RULE, X_REQUEST_ID,
};
pub use response::{ApiError, ApiResponse, RateLimitExceededBody};
pub use server::HttpServer;
