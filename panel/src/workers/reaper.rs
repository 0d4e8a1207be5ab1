//! Session reaper worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::sessions::SessionSupervisor;

/// Reaper worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between two sweeps
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Run the reaper worker. Open sessions are closed when it shuts down.
pub async fn run<S, F>(
    options: &Options,
    supervisor: &SessionSupervisor,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Session reaper starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Session reaper shutting down...");
                supervisor.close_all().await;
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        let report = supervisor.reap_once(Utc::now()).await;
        if report.expired.is_empty() && report.orphans.is_empty() {
            debug!("Reaper sweep found nothing to do");
        } else {
            info!(
                "Reaper closed {} idle session(s) and removed {} orphan helper(s)",
                report.expired.len(),
                report.orphans.len()
            );
        }
    }
}
