use crate::config::ValidationError;
use crate::payload::PayloadError;
use crate::sink::SinkError;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

pub type HandlerBody = BoxBody<Bytes, RelayError>;

/// Errors that can occur while running the relay or handling a beacon
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("Malformed JSON payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("Sink setup failed: {0}")]
    Sink(#[from] SinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            RelayError::RequestBodyError(_)
            | RelayError::MalformedPayload(_)
            | RelayError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing response. Never includes the error details.
    pub fn to_response(&self) -> Response<HandlerBody> {
        let status = self.status();
        let message = match status {
            StatusCode::METHOD_NOT_ALLOWED => "Method not allowed!",
            StatusCode::BAD_REQUEST => "Bad request! Yikes.",
            _ => "Internal error",
        };
        text_response(status, message)
    }
}

pub fn full_body(body: impl Into<Bytes>) -> HandlerBody {
    Full::new(body.into()).map_err(|e| match e {}).boxed()
}

pub fn text_response(status: StatusCode, body: &'static str) -> Response<HandlerBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
}
