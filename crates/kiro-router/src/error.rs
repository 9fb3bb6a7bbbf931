//! Dialect-aware error rendering (spec §7). Each `kiro_core::GatewayError`
//! variant, plus the request-level failures the router itself detects
//! (missing/invalid key, daily limit, unsupported model), maps onto the
//! OpenAI or Claude error body shape depending on which route produced it.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kiro_protocol::{claude, openai};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Claude,
}

#[derive(Debug)]
pub enum RequestError {
    MissingApiKey,
    InvalidApiKey,
    DailyLimitExceeded,
    UnsupportedModel(String),
    Gateway(kiro_core::GatewayError),
}

impl From<kiro_core::GatewayError> for RequestError {
    fn from(err: kiro_core::GatewayError) -> Self {
        RequestError::Gateway(err)
    }
}

pub fn render(dialect: Dialect, err: RequestError) -> Response {
    let (status, kind, message) = classify(&err);
    match dialect {
        Dialect::OpenAi => (
            status,
            Json(openai::ErrorBody {
                error: openai::ErrorDetail { message, kind: kind.to_string(), code: None },
            }),
        )
            .into_response(),
        Dialect::Claude => (
            status,
            Json(claude::ErrorBody {
                kind: "error",
                error: claude::ErrorDetail { kind: kind.to_string(), message },
            }),
        )
            .into_response(),
    }
}

fn classify(err: &RequestError) -> (StatusCode, &'static str, String) {
    match err {
        RequestError::MissingApiKey => {
            (StatusCode::UNAUTHORIZED, "authentication_error", "missing API key".to_string())
        }
        RequestError::InvalidApiKey => {
            (StatusCode::UNAUTHORIZED, "authentication_error", "invalid API key".to_string())
        }
        RequestError::DailyLimitExceeded => {
            (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", "daily request limit exceeded".to_string())
        }
        RequestError::UnsupportedModel(model) => (
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            format!(
                "unsupported model '{model}'; supported models: {}",
                kiro_upstream::SUPPORTED_MODELS.join(", ")
            ),
        ),
        RequestError::Gateway(err) => classify_gateway(err),
    }
}

fn classify_gateway(err: &kiro_core::GatewayError) -> (StatusCode, &'static str, String) {
    use kiro_core::GatewayError::*;
    match err {
        UnsupportedModel(model) => {
            (StatusCode::BAD_REQUEST, "invalid_request_error", format!("unsupported model '{model}'"))
        }
        NoUpstreamAvailable => {
            (StatusCode::SERVICE_UNAVAILABLE, "server_error", "no eligible upstream available".to_string())
        }
        RetriesExhausted(msg) => {
            (StatusCode::BAD_GATEWAY, "server_error", format!("upstream request failed after retries: {msg}"))
        }
        Upstream(e) => (StatusCode::BAD_GATEWAY, "server_error", e.to_string()),
        Storage(e) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", e.to_string()),
        Credential(e) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", e.to_string()),
        InvalidRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_request_error", msg.clone()),
    }
}
