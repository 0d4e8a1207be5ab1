//! Runtime event watcher
//!
//! Backfills an empty event log from recent runtime history, then follows the
//! live event stream, reconnecting with capped exponential backoff.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::errors::PanelError;
use crate::events::EventStore;
use crate::runtime::ContainerRuntime;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Event watcher options
#[derive(Debug, Clone)]
pub struct Options {
    /// How far back an empty log is backfilled
    pub backfill_window: Duration,

    /// Upper bound on the time spent collecting backfill
    pub backfill_timeout: Duration,

    /// Reconnect backoff
    pub cooldown: CooldownOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            backfill_window: Duration::from_secs(24 * 3600),
            backfill_timeout: Duration::from_secs(5),
            cooldown: CooldownOptions::default(),
        }
    }
}

/// Fill an empty log with recent history. Writes an init entry when there is
/// none. Returns the number of entries written.
pub async fn backfill(
    options: &Options,
    runtime: &dyn ContainerRuntime,
    store: &EventStore,
) -> Result<usize, PanelError> {
    if !store.is_empty().await {
        debug!("Event log not empty, skipping backfill");
        return Ok(0);
    }

    let until = Utc::now();
    let window = chrono::Duration::from_std(options.backfill_window)
        .map_err(|e| PanelError::ConfigError(e.to_string()))?;
    let since = until - window;

    let mut written = 0;
    let collect = async {
        let mut events = runtime.events(Some(since), Some(until)).await?;
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    if store.record(&event).await? {
                        written += 1;
                    }
                }
                Err(e) => warn!("Skipping unreadable runtime event: {}", e),
            }
        }
        Ok::<(), PanelError>(())
    };
    match tokio::time::timeout(options.backfill_timeout, collect).await {
        Ok(result) => result?,
        Err(_) => warn!(
            "Event backfill stopped after {:?}",
            options.backfill_timeout
        ),
    }

    if written == 0 {
        store.write_init_entry().await?;
    }
    info!("Backfilled {} runtime event(s)", written);
    Ok(written)
}

/// Run the event watcher
pub async fn run<S, F>(
    options: &Options,
    runtime: &dyn ContainerRuntime,
    store: &EventStore,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Event watcher starting...");

    if let Err(e) = backfill(options, runtime, store).await {
        warn!("Event backfill failed: {}", e);
    }

    let mut attempt: u32 = 0;
    let mut since: DateTime<Utc> = Utc::now();
    loop {
        let connected = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Event watcher shutting down...");
                return;
            }
            result = runtime.events(Some(since), None) => result,
        };

        match connected {
            Ok(mut events) => {
                debug!("Following runtime events since {}", since);
                loop {
                    let next = tokio::select! {
                        _ = &mut shutdown_signal => {
                            info!("Event watcher shutting down...");
                            return;
                        }
                        next = events.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            attempt = 0;
                            if event.time_nano > 0 {
                                since = since.max(Utc.timestamp_nanos(event.time_nano));
                            }
                            if let Err(e) = store.record(&event).await {
                                warn!("Failed to record runtime event: {}", e);
                            }
                        }
                        Some(Err(e)) => {
                            warn!("Runtime event stream failed: {}", e);
                            break;
                        }
                        None => {
                            warn!("Runtime event stream ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("Could not subscribe to runtime events: {}", e),
        }

        let delay = calc_exp_backoff(&options.cooldown, attempt);
        attempt = attempt.saturating_add(1);
        debug!("Reconnecting to runtime events in {:?}", delay);
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Event watcher shutting down...");
                return;
            }
            _ = sleep_fn(delay) => {}
        }
    }
}
