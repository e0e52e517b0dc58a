use crate::core::ProxyError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum WebError {
    Proxy(ProxyError),
    Forbidden(String),
}

impl From<ProxyError> for WebError {
    fn from(err: ProxyError) -> Self {
        WebError::Proxy(err)
    }
}

impl WebError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebError::Proxy(ProxyError::ReloadInProgress) => StatusCode::CONFLICT,
            WebError::Proxy(ProxyError::MalformedRoute(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            WebError::Proxy(ProxyError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
            WebError::Proxy(ProxyError::SchedulerClosed) => StatusCode::SERVICE_UNAVAILABLE,
            WebError::Proxy(ProxyError::Backpressure(_)) => StatusCode::SERVICE_UNAVAILABLE,
            WebError::Proxy(ProxyError::AllReplicasFailed { .. })
            | WebError::Proxy(ProxyError::WriteQuorumNotMet { .. }) => StatusCode::BAD_GATEWAY,
            WebError::Proxy(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WebError::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            WebError::Proxy(ProxyError::ReloadInProgress) => "reloading",
            WebError::Proxy(ProxyError::MalformedRoute(_)) => "malformed_route",
            WebError::Proxy(ProxyError::InvalidKey(_)) => "invalid_key",
            WebError::Proxy(ProxyError::SchedulerClosed) => "closed",
            WebError::Proxy(ProxyError::Backpressure(_)) => "backpressure",
            WebError::Proxy(ProxyError::AllReplicasFailed { .. })
            | WebError::Proxy(ProxyError::WriteQuorumNotMet { .. }) => "replica_failure",
            WebError::Proxy(ProxyError::Io(_)) => "io_error",
            WebError::Proxy(_) => "proxy_error",
            WebError::Forbidden(_) => "forbidden",
        }
    }

    fn message(self) -> String {
        match self {
            WebError::Proxy(err) => err.to_string(),
            WebError::Forbidden(msg) => msg,
        }
    }
}

impl WebError {
    /// Plain-text rendering used by endpoints whose callers read the body as text.
    pub fn into_text_response(self) -> Response {
        let status = self.status();
        (status, self.message()).into_response()
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code().to_string();
        let body = Json(ErrorResponse {
            error: self.message(),
            code,
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;
