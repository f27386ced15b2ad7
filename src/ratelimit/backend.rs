//! Rate limiter trait the HTTP layer is written against.

use async_trait::async_trait;

use super::counter::RateLimitResult;
use super::identity::{ClientIdentity, RequestMeta};
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// The middleware only sees this trait, so it can be driven by the real
/// [`RateLimitService`](super::RateLimitService) or by test doubles.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Count one request from `client` and decide whether it may proceed.
    async fn check_rate_limit(
        &self,
        client: &str,
        endpoint: &str,
        method: &str,
    ) -> Result<RateLimitResult>;

    /// Work out who the request should be counted against.
    fn identify(&self, meta: &RequestMeta<'_>) -> ClientIdentity;
}
