use crate::config::{Config, ValidationError};
use crate::context::RequestContext;
use crate::errors::{HandlerBody, RelayError, full_body, text_response};
use crate::metrics_defs::REQUESTS;
use crate::payload::{InboundPayload, PayloadError, ValidationRules};
use crate::sink::{Sink, forward};
use crate::view_event::{FieldSet, ViewEvent};
use chrono::Utc;
use futures::FutureExt;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    HeaderName, HeaderValue,
};
use http::{HeaderMap, Method};
use http_body_util::{BodyExt, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::task::TaskTracker;

const THANKS: &str = "Thanks for visiting! :)";

// Client hints the browser is asked to send on subsequent requests
const ACCEPT_CH: HeaderName = HeaderName::from_static("accept-ch");
const ACCEPT_CH_LIFETIME: HeaderName = HeaderName::from_static("accept-ch-lifetime");
const CLIENT_HINTS: &str = "UA, Platform, Model, Arch, Viewport-Width, Width";
const CLIENT_HINTS_LIFETIME_SECS: &str = "2592000";

/// Turns beacons into view events and hands them to the sink in the background.
pub struct Relay {
    rules: ValidationRules,
    field_set: FieldSet,
    default_data_center: String,
    max_body_bytes: usize,
    cors_headers: HeaderMap,
    sink: Arc<dyn Sink>,
    tasks: TaskTracker,
}

impl Relay {
    /// Forwards are spawned on `tasks`; the owner of the tracker decides how
    /// long to wait for them on shutdown.
    pub fn new(
        config: &Config,
        sink: Arc<dyn Sink>,
        tasks: TaskTracker,
    ) -> Result<Self, RelayError> {
        let origin = HeaderValue::from_str(&config.cors.allowed_origin).map_err(|_| {
            ValidationError::InvalidAllowedOrigin(config.cors.allowed_origin.clone())
        })?;

        let mut cors_headers = HeaderMap::new();
        cors_headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        cors_headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("POST, OPTIONS"),
        );
        cors_headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type"),
        );
        cors_headers.insert(ACCEPT_CH, HeaderValue::from_static(CLIENT_HINTS));
        cors_headers.insert(
            ACCEPT_CH_LIFETIME,
            HeaderValue::from_static(CLIENT_HINTS_LIFETIME_SECS),
        );

        Ok(Relay {
            rules: config.sink.validation_rules(),
            field_set: config.sink.field_set(),
            default_data_center: config.default_data_center.clone(),
            max_body_bytes: config.max_body_bytes,
            cors_headers,
            sink,
            tasks,
        })
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<HandlerBody>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let response = match self.try_handle(req).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(error = %e, "Rejected beacon");
                e.to_response()
            }
        };

        shared::counter!(REQUESTS, "status" => response.status().as_str().to_owned()).increment(1);
        response
    }

    async fn try_handle<B>(&self, req: Request<B>) -> Result<Response<HandlerBody>, RelayError>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match *req.method() {
            Method::OPTIONS => return Ok(self.with_cors(Response::new(full_body(Bytes::new())))),
            Method::POST => {}
            _ => return Err(RelayError::MethodNotAllowed),
        }

        let (parts, body) = req.into_parts();
        let context = RequestContext::from_headers(&parts.headers);

        let bytes = Limited::new(body, self.max_body_bytes)
            .collect()
            .await
            .map_err(|e| RelayError::RequestBodyError(e.to_string()))?
            .to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let payload = InboundPayload::from_json(&value, self.rules)?;

        // The payload is the canonical timezone source; the edge only fills in
        // when the sink tolerates a payload without one.
        let timezone = payload
            .timezone
            .clone()
            .or_else(|| match self.rules.require_timezone {
                true => None,
                false => context.timezone.clone(),
            })
            .ok_or(PayloadError::InvalidField("timezone"))?;

        let event = ViewEvent::build(
            payload,
            timezone,
            &context,
            self.field_set,
            &self.default_data_center,
            Utc::now(),
        );

        let sink = self.sink.clone();
        self.tasks.spawn(async move { forward(sink.as_ref(), event).await });

        Ok(self.with_cors(text_response(StatusCode::OK, THANKS)))
    }

    fn with_cors(&self, mut response: Response<HandlerBody>) -> Response<HandlerBody> {
        response.headers_mut().extend(self.cors_headers.clone());
        response
    }
}

#[derive(Clone)]
pub struct RelayService {
    relay: Arc<Relay>,
}

impl RelayService {
    pub fn new(relay: Relay) -> Self {
        RelayService {
            relay: Arc::new(relay),
        }
    }
}

impl Service<Request<Incoming>> for RelayService {
    type Response = Response<HandlerBody>;
    type Error = RelayError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let relay = self.relay.clone();

        Box::pin(async move {
            match AssertUnwindSafe(relay.handle(req)).catch_unwind().await {
                Ok(response) => Ok(response),
                Err(_) => {
                    tracing::error!("Panic while handling beacon");
                    Ok(RelayError::InternalError("handler panicked".into()).to_response())
                }
            }
        })
    }
}
