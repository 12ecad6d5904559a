//! Typed error taxonomy and its mapping onto HTTP status codes.
//!
//! Components return one of these kinds; the router is the only place
//! that knows how a kind becomes a status code and a body. Nothing here
//! carries a `session_token` or unredacted `client_id` — callers that log
//! an error log the kind, not the request that produced it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("mailbox gone")]
    MailboxGone,

    #[error("token unknown")]
    TokenUnknown,

    #[error("token already consumed")]
    TokenConsumed,

    #[error("participant limit exceeded")]
    ParticipantLimitExceeded,

    #[error("mailbox full")]
    MailboxFull,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("backing store unavailable")]
    ServiceUnavailable,

    #[error("request timed out")]
    RequestTimeout,

    #[error("internal error ({correlation_id})")]
    Internal { correlation_id: String },
}

impl SignalingError {
    /// Invariant-violation escape hatch: logs full context, returns a 500
    /// carrying only a correlation id the client can report back.
    pub fn internal(context: impl std::fmt::Display) -> Self {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::error!(%correlation_id, %context, "internal invariant violation");
        Self::Internal { correlation_id }
    }
}

impl IntoResponse for SignalingError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            SignalingError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            SignalingError::AuthFailed => (StatusCode::UNAUTHORIZED, "auth_failed"),
            SignalingError::MailboxGone => (StatusCode::NOT_FOUND, "mailbox_gone"),
            SignalingError::TokenUnknown => (StatusCode::NOT_FOUND, "token_unknown"),
            SignalingError::TokenConsumed => (StatusCode::CONFLICT, "token_consumed"),
            SignalingError::ParticipantLimitExceeded => {
                (StatusCode::CONFLICT, "participant_limit_exceeded")
            }
            SignalingError::MailboxFull => (StatusCode::CONFLICT, "mailbox_full"),
            SignalingError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            SignalingError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            SignalingError::ServiceUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            SignalingError::RequestTimeout => (StatusCode::REQUEST_TIMEOUT, "request_timeout"),
            SignalingError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        let mut body = json!({ "error": code, "message": self.to_string() });
        if let SignalingError::Internal { correlation_id } = &self {
            body["correlation_id"] = json!(correlation_id);
        }

        let mut response = (status, Json(body)).into_response();
        if let SignalingError::RateLimited { retry_after_secs } = &self {
            response
                .headers_mut()
                .insert("Retry-After", retry_after_secs.to_string().parse().unwrap());
        }
        response
    }
}

/// Redact a secret to its first 8 characters, for logging above DEBUG.
pub fn redact(secret: &str) -> String {
    secret.chars().take(8).collect()
}
