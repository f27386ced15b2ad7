//! JSON response envelopes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::SecondsFormat;
use serde::Serialize;

use crate::error::RateLimitError;
use crate::ratelimit::RateLimitResult;

/// Standard API envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Errors returned by the admin API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Config(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ApiResponse::<()>::error(self.to_string()))).into_response()
    }
}

/// Body of a 429 response.
#[derive(Debug, Serialize)]
pub struct RateLimitExceededBody {
    pub success: bool,
    pub message: String,
    pub errors: Vec<String>,
    pub error: RateLimitErrorDetail,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitErrorDetail {
    pub rate_limit: RateLimitInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub limit: u64,
    /// RFC 3339, UTC
    pub reset_time: String,
    /// Whole seconds, rounded up
    pub retry_after: u64,
    pub endpoint: String,
    pub trace_id: String,
}

impl RateLimitExceededBody {
    pub fn new(result: &RateLimitResult, endpoint: &str, trace_id: &str) -> Self {
        Self {
            success: false,
            message: format!(
                "Too many requests. You have exceeded the rate limit of {} requests. Please try again later.",
                result.limit
            ),
            errors: vec!["Too many requests".to_string()],
            error: RateLimitErrorDetail {
                rate_limit: RateLimitInfo {
                    limit: result.limit,
                    reset_time: result.reset_time.to_rfc3339_opts(SecondsFormat::Secs, true),
                    retry_after: result.retry_after_secs(),
                    endpoint: endpoint.to_string(),
                    trace_id: trace_id.to_string(),
                },
            },
        }
    }
}

impl IntoResponse for RateLimitExceededBody {
    fn into_response(self) -> Response {
        (StatusCode::TOO_MANY_REQUESTS, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::add_duration;
    use crate::ratelimit::ClientRateLimitState;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    #[test]
    fn test_denial_body_shape() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let state = ClientRateLimitState::first_request(start);
        let now = add_duration(start, Duration::from_millis(500));
        let result = RateLimitResult::denied("auth", 10, Duration::from_secs(60), &state, now);

        let body = serde_json::to_value(RateLimitExceededBody::new(
            &result,
            "/api/v1/auth/login",
            "trace-1",
        ))
        .unwrap();

        assert_eq!(body["success"], false);
        assert_eq!(
            body["message"],
            "Too many requests. You have exceeded the rate limit of 10 requests. Please try again later."
        );
        assert_eq!(body["errors"][0], "Too many requests");
        let info = &body["error"]["rateLimit"];
        assert_eq!(info["limit"], 10);
        assert_eq!(info["resetTime"], "2026-03-01T12:01:00Z");
        assert_eq!(info["retryAfter"], 60);
        assert_eq!(info["endpoint"], "/api/v1/auth/login");
        assert_eq!(info["traceId"], "trace-1");
    }

    #[test]
    fn test_config_error_is_bad_request() {
        let response = ApiError::from(RateLimitError::Config("limit must be greater than 0".into()))
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ApiError::from(RateLimitError::Storage("down".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
