//! Job listing, detail and log streaming

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
        IntoResponse,
    },
    Json,
};
use serde::Deserialize;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};

use crate::errors::PanelError;
use crate::jobs::{Job, JobStatus, JobSubscription, LogEntry};
use crate::server::state::ServerState;

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Query string of `GET /api/jobs`; both filters take comma separated values
#[derive(Debug, Default, Deserialize)]
pub struct JobListParams {
    pub kind: Option<String>,
    pub status: Option<String>,
}

fn split_filter(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// `GET /api/jobs`
pub async fn list_jobs_handler(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<JobListParams>,
) -> Result<impl IntoResponse, PanelError> {
    let kinds = split_filter(params.kind.as_deref());
    let statuses = split_filter(params.status.as_deref())
        .iter()
        .map(|s| s.parse::<JobStatus>().map_err(PanelError::ValidationError))
        .collect::<Result<Vec<_>, _>>()?;

    let summaries: Vec<_> = state
        .jobs
        .list(&kinds, &statuses)
        .iter()
        .map(|job| job.summary())
        .collect();
    Ok(Json(summaries))
}

/// `GET /api/jobs/{id}`
pub async fn get_job_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, PanelError> {
    let job = state
        .jobs
        .get_job(&id)
        .ok_or_else(|| PanelError::NotFound(format!("job {} not found", id)))?;
    Ok(Json(job.snapshot()))
}

fn log_event(seq: usize, entry: &LogEntry) -> Option<Event> {
    Event::default()
        .id(seq.to_string())
        .json_data(entry)
        .ok()
}

/// Final message of every stream
fn result_event(job: &Job) -> Event {
    let snapshot = job.snapshot();
    let mut payload = serde_json::json!({
        "type": "result",
        "status": snapshot.status,
    });
    if let Some(result) = snapshot.result {
        payload["result"] = result;
    }
    if !snapshot.error.is_empty() {
        payload["message"] = serde_json::Value::String(snapshot.error);
    }
    Event::default().data(payload.to_string())
}

/// Build the stream for one observer: history after `last_seen`, then the
/// live tail, then the result once the job has finished.
pub fn job_event_stream(job: Arc<Job>, last_seen: usize) -> EventStream {
    let JobSubscription { history, live, .. } = job.subscribe();

    let history_events: Vec<Result<Event, Infallible>> = history
        .iter()
        .enumerate()
        .skip(last_seen)
        .filter_map(|(i, entry)| log_event(i + 1, entry))
        .map(Ok)
        .collect();
    let history_stream = tokio_stream::iter(history_events);

    let live_stream: EventStream = match live {
        Some(receiver) => Box::pin(BroadcastStream::new(receiver).filter_map(move |item| {
            match item {
                Ok(sequenced) if sequenced.seq > last_seen => {
                    log_event(sequenced.seq, &sequenced.entry).map(Ok)
                }
                // lagged receivers skip what they missed
                _ => None,
            }
        })),
        None => Box::pin(tokio_stream::empty()),
    };

    let result_stream = futures::stream::once(async move {
        job.wait().await;
        Ok::<Event, Infallible>(result_event(&job))
    });

    Box::pin(history_stream.chain(live_stream).chain(result_stream))
}

/// `GET /api/jobs/{id}/events`
pub async fn job_events_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<KeepAliveStream<EventStream>>, PanelError> {
    let job = state
        .jobs
        .get_job(&id)
        .ok_or_else(|| PanelError::NotFound(format!("job {} not found", id)))?;

    let last_seen = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    Ok(Sse::new(job_event_stream(job, last_seen)).keep_alive(
        KeepAlive::new()
            .interval(state.sse_keep_alive)
            .text("keepalive"),
    ))
}
