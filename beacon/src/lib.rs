pub mod config;
pub mod context;
pub mod credentials;
pub mod errors;
pub mod metrics_defs;
pub mod payload;
pub mod service;
pub mod sink;
pub mod view_event;

#[cfg(test)]
mod testutils;

use errors::RelayError;
use service::{Relay, RelayService};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Serves beacons until `shutdown` resolves, then waits for in-flight forwards.
pub async fn run<F>(config: config::Config, shutdown: F) -> Result<(), RelayError>
where
    F: Future<Output = ()>,
{
    config.validate()?;

    let sink = sink::from_config(&config.sink)?;
    tracing::info!(sink = sink.name(), "Starting beacon relay");

    let tasks = TaskTracker::new();
    let relay = Relay::new(&config, sink, tasks.clone())?;
    let stop = CancellationToken::new();

    let relay_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        RelayService::new(relay),
        stop.clone().cancelled_owned(),
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::<_, RelayError>::new(|| true),
        stop.clone().cancelled_owned(),
    );
    let signal_task = async {
        shutdown.await;
        stop.cancel();
        Ok::<(), RelayError>(())
    };

    let result = tokio::try_join!(relay_task, admin_task, signal_task);

    tasks.close();
    tracing::info!(pending = tasks.len(), "Waiting for in-flight forwards");
    tasks.wait().await;

    result.map(|_| ())
}
