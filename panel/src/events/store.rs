//! Rotated, deduplicated NDJSON event log

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use tracing::{debug, warn};

use openapi_server::models::EventLogEntry;

use crate::errors::PanelError;
use crate::filesys::file::File;
use crate::runtime::RuntimeEvent;

/// Event store options
#[derive(Debug, Clone)]
pub struct Options {
    /// Size at which the current file is rotated
    pub max_bytes: u64,
    /// Dedup cache size that triggers pruning
    pub dedup_prune_threshold: usize,
    /// Age after which dedup entries may be pruned
    pub dedup_ttl: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            dedup_prune_threshold: 1000,
            dedup_ttl: Duration::minutes(5),
        }
    }
}

/// Map a runtime event to a log entry. Only container lifecycle events are kept.
pub fn classify(event: &RuntimeEvent) -> Option<EventLogEntry> {
    if event.kind != "container" {
        return None;
    }
    let (level, type_class) = match event.action.as_str() {
        "start" | "create" | "unpause" => ("success", "success"),
        "stop" | "die" | "kill" | "pause" | "oom" => ("warning", "warning"),
        "destroy" | "delete" => ("error", "danger"),
        _ => return None,
    };

    let who = if event.actor_name.is_empty() {
        event.actor_id.chars().take(12).collect()
    } else {
        event.actor_name.clone()
    };
    let at = Utc.timestamp_nanos(event.time_nano);

    Some(EventLogEntry {
        id: format!("{}-{}-{}", event.actor_id, event.action, event.time_nano),
        level: level.to_string(),
        type_class: type_class.to_string(),
        time: at.with_timezone(&Local).format("%H:%M:%S").to_string(),
        message: format!("container {}: {}", event.action, who),
        timestamp: at.timestamp(),
    })
}

/// Append-only event log with single-generation rotation
pub struct EventStore {
    options: Options,
    file: File,
    rotated: File,
    write_lock: tokio::sync::Mutex<()>,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl EventStore {
    pub fn new(file: File, options: Options) -> Self {
        let rotated = File::new(format!("{}.1", file.path().display()));
        Self {
            options,
            file,
            rotated,
            write_lock: tokio::sync::Mutex::new(()),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record a runtime event; returns whether anything was written
    pub async fn record(&self, event: &RuntimeEvent) -> Result<bool, PanelError> {
        match classify(event) {
            Some(entry) => self.append(&entry).await,
            None => Ok(false),
        }
    }

    /// Append an entry unless its id was seen recently
    pub async fn append(&self, entry: &EventLogEntry) -> Result<bool, PanelError> {
        if !self.mark_seen(&entry.id) {
            debug!("Skipping duplicate event {}", entry.id);
            return Ok(false);
        }

        // an entry that was not written may be delivered again
        if let Err(e) = self.write_entry(entry).await {
            self.forget(&entry.id);
            return Err(e);
        }
        Ok(true)
    }

    async fn write_entry(&self, entry: &EventLogEntry) -> Result<(), PanelError> {
        let line = serde_json::to_string(entry)?;
        let _guard = self.write_lock.lock().await;
        if self.file.len().await + line.len() as u64 + 1 > self.options.max_bytes {
            self.rotate().await?;
        }
        self.file.append_line(&line).await
    }

    fn forget(&self, id: &str) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    fn mark_seen(&self, id: &str) -> bool {
        let now = Utc::now();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if seen.contains_key(id) {
            return false;
        }
        seen.insert(id.to_string(), now);
        if seen.len() > self.options.dedup_prune_threshold {
            let cutoff = now - self.options.dedup_ttl;
            seen.retain(|_, at| *at >= cutoff);
        }
        true
    }

    async fn rotate(&self) -> Result<(), PanelError> {
        if self.file.exists().await {
            debug!("Rotating event log {}", self.file.path().display());
            self.file.rename_to(&self.rotated).await?;
        }
        Ok(())
    }

    /// Whether neither the current nor the rotated file holds anything
    pub async fn is_empty(&self) -> bool {
        self.file.len().await == 0 && self.rotated.len().await == 0
    }

    /// Marker written when a fresh log finds no history to backfill
    pub async fn write_init_entry(&self) -> Result<(), PanelError> {
        let now = Utc::now();
        let entry = EventLogEntry {
            id: format!("init-{}", now.timestamp_nanos_opt().unwrap_or_default()),
            level: "info".to_string(),
            type_class: "info".to_string(),
            time: now.with_timezone(&Local).format("%H:%M:%S").to_string(),
            message: "event log initialized".to_string(),
            timestamp: now.timestamp(),
        };
        self.append(&entry).await.map(|_| ())
    }

    /// Newest entries first, at most `limit`
    pub async fn recent(&self, limit: usize) -> Result<Vec<EventLogEntry>, PanelError> {
        let mut entries = read_entries(&self.file).await?;
        if entries.len() < limit {
            entries.extend(read_entries(&self.rotated).await?);
        }
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        Ok(entries)
    }
}

async fn read_entries(file: &File) -> Result<Vec<EventLogEntry>, PanelError> {
    if !file.exists().await {
        return Ok(Vec::new());
    }
    let contents = file.read_string().await?;
    let mut entries = Vec::new();
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<EventLogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("Skipping malformed event log line: {}", e),
        }
    }
    Ok(entries)
}
