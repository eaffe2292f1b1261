mod bearer;
mod firestore;

pub use bearer::BearerSink;
pub use firestore::{FirestoreDocument, FirestoreSink};

use crate::config::SinkConfig;
use crate::credentials::CredentialError;
use crate::metrics_defs::FORWARD_DURATION;
use crate::view_event::ViewEvent;
use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("sink responded with status {0}")]
    UnexpectedStatus(StatusCode),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("invalid sink URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// A backend that stores or relays view events.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Makes exactly one delivery attempt.
    async fn send(&self, event: &ViewEvent) -> Result<(), SinkError>;
}

/// Delivers `event` on a best-effort basis. Failures are logged and counted,
/// never retried and never reported back to the caller.
pub async fn forward(sink: &dyn Sink, event: ViewEvent) {
    let start = Instant::now();
    let result = sink.send(&event).await;
    let elapsed = start.elapsed();

    let status = match &result {
        Ok(()) => "ok",
        Err(_) => "error",
    };
    shared::histogram!(FORWARD_DURATION, "sink" => sink.name(), "status" => status)
        .record(elapsed.as_secs_f64());

    match result {
        Ok(()) => tracing::debug!(sink = sink.name(), ?elapsed, "Forwarded view event"),
        Err(e) => tracing::warn!(sink = sink.name(), error = %e, "Failed to forward view event"),
    }
}

/// Builds the sink described by `config`.
pub fn from_config(config: &SinkConfig) -> Result<Arc<dyn Sink>, SinkError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs()))
        .build()?;

    let sink: Arc<dyn Sink> = match config {
        SinkConfig::StatsCollector(c) => Arc::new(BearerSink::new(
            config.name(),
            client,
            &c.endpoint,
            "stats",
            c.access_token.clone(),
        )?),
        SinkConfig::WebApi(c) => Arc::new(BearerSink::new(
            config.name(),
            client,
            &c.endpoint,
            "stats/views",
            c.access_token.clone(),
        )?),
        SinkConfig::Firestore(c) => Arc::new(FirestoreSink::from_config(client, c)?),
    };

    Ok(sink)
}

/// Joins `path` onto `base` as plain concatenation, keeping any path `base` already has.
fn endpoint_url(base: &url::Url, path: &str) -> Result<url::Url, url::ParseError> {
    url::Url::parse(&format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    ))
}
