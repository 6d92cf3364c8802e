use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the whole service.
///
/// Every variant maps to an HTTP status and a stable snake_cased `name`
/// carried in the JSON error body, e.g. `{"error":{"name":"no_such_account"}}`.
/// The names are part of the external contract and must not be renamed,
/// including the historical `qouta_exceeded` spelling.
#[derive(Error, Debug)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("method not allowed")]
    InvalidMethod,
    #[error("invalid value for parameter {0}")]
    InvalidParam(String),
    #[error("missing required parameter {0}")]
    MissingParam(String),
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("could not parse proxy url")]
    InvalidProxyUrl,
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("multipart request contains no file")]
    FileMissing,
    #[error("content-length required")]
    LengthRequired,
    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },
    #[error("no such account: {0}")]
    NoSuchAccount(String),
    #[error("not found")]
    NotFound,
    #[error("account reputation too low")]
    Deplorable,
    #[error("upload quota exceeded")]
    QoutaExceeded { reset: u64 },
    #[error("blacklisted")]
    Blacklisted,
    #[error("upstream error: {0}")]
    UpstreamError(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// CamelCase kind name; the wire name is derived from this.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "BadRequest",
            Error::InvalidMethod => "InvalidMethod",
            Error::InvalidParam(_) => "InvalidParam",
            Error::MissingParam(_) => "MissingParam",
            Error::InvalidSignature => "InvalidSignature",
            Error::InvalidProxyUrl => "InvalidProxyUrl",
            Error::InvalidImage(_) => "InvalidImage",
            Error::FileMissing => "FileMissing",
            Error::LengthRequired => "LengthRequired",
            Error::PayloadTooLarge { .. } => "PayloadTooLarge",
            Error::NoSuchAccount(_) => "NoSuchAccount",
            Error::NotFound => "NotFound",
            Error::Deplorable => "Deplorable",
            Error::QoutaExceeded { .. } => "QoutaExceeded",
            Error::Blacklisted => "Blacklisted",
            Error::UpstreamError(_) => "UpstreamError",
            Error::InternalError(_) => "InternalError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest(_)
            | Error::InvalidParam(_)
            | Error::MissingParam(_)
            | Error::InvalidSignature
            | Error::InvalidProxyUrl
            | Error::InvalidImage(_)
            | Error::FileMissing
            | Error::UpstreamError(_) => StatusCode::BAD_REQUEST,
            Error::InvalidMethod => StatusCode::METHOD_NOT_ALLOWED,
            Error::LengthRequired => StatusCode::LENGTH_REQUIRED,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::NoSuchAccount(_) | Error::NotFound => StatusCode::NOT_FOUND,
            Error::Deplorable => StatusCode::FORBIDDEN,
            Error::QoutaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Blacklisted => StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS,
            Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Optional structured payload under `error.info`.
    fn info(&self) -> Option<serde_json::Value> {
        match self {
            Error::InvalidParam(name) | Error::MissingParam(name) => {
                Some(json!({ "param": name }))
            }
            Error::PayloadTooLarge { limit } => Some(json!({ "limit": limit })),
            Error::NoSuchAccount(name) => Some(json!({ "account": name })),
            Error::QoutaExceeded { reset } => Some(json!({ "reset": reset })),
            _ => None,
        }
    }
}

/// `"NoSuchAccount"` -> `"no_such_account"`.
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::info!(error = %self, name = self.kind(), "request rejected");
        }
        let name = camel_to_snake(self.kind());
        let body = match self.info() {
            Some(info) => json!({ "error": { "name": name, "info": info } }),
            None => json!({ "error": { "name": name } }),
        };
        (status, Json(body)).into_response()
    }
}
