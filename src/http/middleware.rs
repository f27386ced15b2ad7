//! Tower middleware that enforces rate limits on an axum router.
//!
//! Every request goes through the same steps: exempt paths and whitelisted
//! callers pass untouched, everything else is counted. Allowed responses get
//! the `X-RateLimit-*` headers; denied requests are answered with a 429 and
//! never reach the inner service. Any failure inside enforcement lets the
//! request through.

use axum::{
    extract::{ConnectInfo, Request},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use futures::future::{BoxFuture, FutureExt};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::response::RateLimitExceededBody;
use crate::config::RateLimitOptions;
use crate::monitoring::MonitoringService;
use crate::ratelimit::{
    AuthenticatedPrincipal, Clock, IpWhitelist, RateLimitBackend, RateLimitResult, RequestMeta,
    SystemClock,
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_RULE: HeaderName = HeaderName::from_static("x-ratelimit-rule");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Rate limit layer.
#[derive(Clone)]
pub struct RateLimitLayer {
    shared: Arc<Shared>,
}

#[derive(Clone)]
struct Shared {
    backend: Arc<dyn RateLimitBackend>,
    monitoring: Option<Arc<MonitoringService>>,
    clock: Arc<dyn Clock>,
    /// Lower-cased path fragments
    exempt_paths: Vec<String>,
    whitelist: Option<IpWhitelist>,
}

impl RateLimitLayer {
    /// A layer with the default exempt paths and no whitelist.
    pub fn new(backend: Arc<dyn RateLimitBackend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                monitoring: None,
                clock: Arc::new(SystemClock),
                exempt_paths: Vec::new(),
                whitelist: None,
            }),
        }
        .with_exempt_paths(["/health", "/swagger", "/files"])
    }

    /// A layer configured from options.
    pub fn from_options(backend: Arc<dyn RateLimitBackend>, options: &RateLimitOptions) -> Self {
        let layer = Self::new(backend).with_exempt_paths(&options.exempt_paths);
        if options.enable_ip_whitelist {
            layer.with_whitelist(IpWhitelist::new(&options.ip_whitelist))
        } else {
            layer
        }
    }

    pub fn with_monitoring(mut self, monitoring: Arc<MonitoringService>) -> Self {
        Arc::make_mut(&mut self.shared).monitoring = Some(monitoring);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        Arc::make_mut(&mut self.shared).clock = clock;
        self
    }

    pub fn with_exempt_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Arc::make_mut(&mut self.shared).exempt_paths = paths
            .into_iter()
            .map(|p| p.as_ref().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        self
    }

    /// An empty whitelist is the same as none.
    pub fn with_whitelist(mut self, whitelist: IpWhitelist) -> Self {
        Arc::make_mut(&mut self.shared).whitelist = (!whitelist.is_empty()).then_some(whitelist);
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            shared: self.shared.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> Service<Request> for RateLimitMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // Keep the service that was polled ready.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let shared = self.shared.clone();

        Box::pin(shared.handle(req, inner))
    }
}

impl Shared {
    fn is_exempt(&self, path: &str) -> bool {
        let path = path.to_ascii_lowercase();
        self.exempt_paths.iter().any(|fragment| path.contains(fragment))
    }

    #[instrument(
        skip_all,
        fields(path = %req.uri().path(), method = %req.method())
    )]
    async fn handle<S>(self: Arc<Self>, req: Request, mut inner: S) -> Result<Response, S::Error>
    where
        S: Service<Request, Response = Response>,
    {
        let path = req.uri().path().to_string();
        let method = req.method().as_str().to_string();

        if self.is_exempt(&path) {
            debug!("Path exempt from rate limiting");
            return inner.call(req).await;
        }

        let (client, caller_ip) = {
            let peer = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            let meta = RequestMeta::new(req.headers())
                .with_principal(req.extensions().get::<AuthenticatedPrincipal>())
                .with_peer(peer);
            (self.backend.identify(&meta).key(), meta.client_ip())
        };

        if let (Some(whitelist), Some(ip)) = (&self.whitelist, caller_ip) {
            if whitelist.contains(ip) {
                debug!(client = %client, ip = %ip, "Whitelisted caller, skipping rate limit");
                return inner.call(req).await;
            }
        }

        let check = AssertUnwindSafe(self.backend.check_rate_limit(&client, &path, &method))
            .catch_unwind()
            .await;

        let result = match check {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(
                    client = %client,
                    path = %path,
                    method = %method,
                    error = %e,
                    "Rate limit check failed, allowing request"
                );
                return inner.call(req).await;
            }
            Err(_) => {
                error!(
                    client = %client,
                    path = %path,
                    method = %method,
                    "Rate limit check panicked, allowing request"
                );
                return inner.call(req).await;
            }
        };

        if let Some(monitoring) = &self.monitoring {
            monitoring.record_request(
                &client,
                &path,
                &method,
                &result.rule,
                self.clock.now(),
                !result.allowed,
            );
        }

        if result.degraded {
            return inner.call(req).await;
        }

        if !result.allowed {
            warn!(
                client = %client,
                path = %path,
                method = %method,
                rule = %result.rule,
                limit = result.limit,
                "Rate limit exceeded"
            );

            let trace_id = req
                .headers()
                .get(X_REQUEST_ID)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            let mut response = RateLimitExceededBody::new(&result, &path, &trace_id).into_response();
            apply_rate_limit_headers(response.headers_mut(), &result);
            return Ok(response);
        }

        let mut response = inner.call(req).await?;
        apply_rate_limit_headers(response.headers_mut(), &result);
        Ok(response)
    }
}

/// Write the quota headers for a decision.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(result.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(result.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(result.reset_unix()));
    if let Ok(rule) = HeaderValue::from_str(&result.rule) {
        headers.insert(X_RATELIMIT_RULE, rule);
    }

    if !result.allowed {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(result.retry_after_secs()));
    }
}
