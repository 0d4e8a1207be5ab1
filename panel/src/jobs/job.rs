//! A single tracked job

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use openapi_server::models::JobSummary;

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Success | JobStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" | "error" => Ok(JobStatus::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Severity of a job log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Info,
    Warning,
    Error,
    Success,
}

/// One line of a job log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
}

/// A log entry with its 1-based position in the job log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedEntry {
    pub seq: usize,
    pub entry: LogEntry,
}

/// Full, serializable view of a job
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: JobStatus,
    pub logs: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What an observer gets when it attaches to a job.
///
/// `history` and `live` are taken under the same lock: every entry appended
/// after the snapshot is delivered on `live` (unless dropped because the
/// channel was full) and none is delivered twice. `live` is `None` once the
/// job has finished.
pub struct JobSubscription {
    pub history: Vec<LogEntry>,
    pub live: Option<broadcast::Receiver<SequencedEntry>>,
    pub done: watch::Receiver<bool>,
}

struct JobInner {
    status: JobStatus,
    logs: Vec<LogEntry>,
    result: Option<Value>,
    error: String,
    updated_at: DateTime<Utc>,
    log_tx: Option<broadcast::Sender<SequencedEntry>>,
}

/// A tracked asynchronous operation
pub struct Job {
    id: String,
    kind: String,
    created_at: DateTime<Utc>,
    log_capacity: usize,
    inner: Mutex<JobInner>,
    done_tx: watch::Sender<bool>,
    finished: AtomicBool,
    dropped: AtomicU64,
}

impl Job {
    pub(crate) fn new(id: String, kind: &str, log_capacity: usize) -> Self {
        let log_capacity = log_capacity.max(1);
        let (log_tx, _) = broadcast::channel(log_capacity);
        let (done_tx, _) = watch::channel(false);
        let now = Utc::now();
        Self {
            id,
            kind: kind.to_string(),
            created_at: now,
            log_capacity,
            inner: Mutex::new(JobInner {
                status: JobStatus::Pending,
                logs: Vec::new(),
                result: None,
                error: String::new(),
                updated_at: now,
                log_tx: Some(log_tx),
            }),
            done_tx,
            finished: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> JobStatus {
        self.lock().status
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.lock().logs.clone()
    }

    /// Number of live-tail publishes skipped because the channel was full
    pub fn dropped_logs(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Append a log line and publish it to live observers without blocking.
    pub fn append_log(&self, kind: LogKind, message: impl Into<String>) {
        let entry = LogEntry {
            time: Utc::now(),
            kind,
            message: message.into(),
        };

        let mut inner = self.lock();
        inner.updated_at = entry.time;
        if let Some(tx) = &inner.log_tx {
            if tx.receiver_count() > 0 {
                if tx.len() >= self.log_capacity {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                } else {
                    let _ = tx.send(SequencedEntry {
                        seq: inner.logs.len() + 1,
                        entry: entry.clone(),
                    });
                }
            }
        }
        inner.logs.push(entry);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append_log(LogKind::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.append_log(LogKind::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append_log(LogKind::Error, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.append_log(LogKind::Success, message);
    }

    /// Move the job forward. Returns `false` and leaves the job untouched when
    /// `status` would not advance it.
    pub fn set_status(&self, status: JobStatus) -> bool {
        let mut inner = self.lock();
        if status.rank() <= inner.status.rank() {
            debug!(
                "Job {} rejected status change {:?} -> {:?}",
                self.id, inner.status, status
            );
            return false;
        }
        inner.status = status;
        inner.updated_at = Utc::now();
        true
    }

    /// Record the terminal outcome and close the live channel and the
    /// completion signal. Only the first call has any effect; the return value
    /// tells whether this call was it.
    pub fn finish(&self, status: JobStatus, result: Option<Value>, error: impl Into<String>) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }

        let status = if status.is_terminal() {
            status
        } else {
            warn!("Job {} finished with non-terminal status {:?}", self.id, status);
            JobStatus::Failed
        };

        {
            let mut inner = self.lock();
            if !inner.status.is_terminal() {
                inner.status = status;
            }
            inner.result = result;
            inner.error = error.into();
            inner.updated_at = Utc::now();
            // dropping the sender closes every receiver once drained
            inner.log_tx = None;
        }

        self.done_tx.send_replace(true);
        true
    }

    /// Attach an observer
    pub fn subscribe(&self) -> JobSubscription {
        let inner = self.lock();
        JobSubscription {
            history: inner.logs.clone(),
            live: inner.log_tx.as_ref().map(|tx| tx.subscribe()),
            done: self.done_tx.subscribe(),
        }
    }

    /// Wait until the job has finished
    pub async fn wait(&self) {
        let mut done = self.done_tx.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let inner = self.lock();
        JobSnapshot {
            id: self.id.clone(),
            kind: self.kind.clone(),
            status: inner.status,
            logs: inner.logs.clone(),
            result: inner.result.clone(),
            error: inner.error.clone(),
            created_at: self.created_at,
            updated_at: inner.updated_at,
        }
    }

    pub fn summary(&self) -> JobSummary {
        let inner = self.lock();
        JobSummary {
            id: self.id.clone(),
            kind: self.kind.clone(),
            status: inner.status.as_str().to_string(),
            result: inner.result.clone(),
            error: inner.error.clone(),
            created_at: self.created_at,
            updated_at: inner.updated_at,
            log_count: inner.logs.len(),
            dropped_log_count: self.dropped_logs(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn job(capacity: usize) -> Job {
        Job::new("1".to_string(), "deploy", capacity)
    }

    #[test]
    fn test_status_only_moves_forward() {
        let job = job(8);
        assert_eq!(job.status(), JobStatus::Pending);
        assert!(job.set_status(JobStatus::Running));
        assert!(!job.set_status(JobStatus::Pending));
        assert!(!job.set_status(JobStatus::Running));
        assert!(job.set_status(JobStatus::Success));
        assert!(!job.set_status(JobStatus::Failed));
        assert_eq!(job.status(), JobStatus::Success);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let job = job(8);
        job.set_status(JobStatus::Running);
        assert!(job.finish(JobStatus::Failed, None, "boom"));
        assert!(!job.finish(JobStatus::Success, Some(serde_json::json!({"x": 1})), ""));

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.error, "boom");
        assert!(snapshot.result.is_none());
    }

    #[test]
    fn test_racing_finish_has_one_winner() {
        let job = Arc::new(job(8));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let job = job.clone();
                std::thread::spawn(move || {
                    let status = if i % 2 == 0 { JobStatus::Success } else { JobStatus::Failed };
                    job.finish(status, None, "")
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(job.status().is_terminal());
    }

    #[test]
    fn test_subscribe_after_finish_has_no_live_channel() {
        let job = job(8);
        job.info("one");
        job.finish(JobStatus::Success, None, "");
        job.info("late");

        let sub = job.subscribe();
        assert!(sub.live.is_none());
        assert!(*sub.done.borrow());
        assert_eq!(sub.history.len(), 2);
    }

    #[tokio::test]
    async fn test_live_tail_sees_entries_after_snapshot() {
        let job = job(8);
        job.info("before");
        let mut sub = job.subscribe();
        job.info("after");
        job.finish(JobStatus::Success, None, "");

        assert_eq!(sub.history.len(), 1);
        let live = sub.live.as_mut().unwrap();
        let next = live.recv().await.unwrap();
        assert_eq!(next.seq, 2);
        assert_eq!(next.entry.message, "after");
        assert!(live.recv().await.is_err());
    }

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let job = job(2);
        let _sub = job.subscribe();
        for i in 0..5 {
            job.info(format!("line {i}"));
        }
        assert_eq!(job.logs().len(), 5);
        assert_eq!(job.dropped_logs(), 3);
    }
}
