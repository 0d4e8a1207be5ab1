//! Compose output streaming into job logs

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::jobs::{Job, LogKind};

/// Flush a partial line after this long without new output
pub const DEFAULT_IDLE_FLUSH: Duration = Duration::from_secs(2);

/// Splits raw process output into lines on `\n` or `\r`
#[derive(Debug, Default)]
pub struct LineCoalescer {
    pending: Vec<u8>,
}

impl LineCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the lines it completed. Blank lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if let Some(line) = self.take() {
                    lines.push(line);
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Emit whatever partial line is buffered
    pub fn flush(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw).trim_end().to_string();
        (!line.trim().is_empty()).then_some(line)
    }
}

/// Log level for one line of compose output
pub fn classify_line(line: &str) -> LogKind {
    if line.to_lowercase().contains("error") {
        LogKind::Error
    } else if line.contains("Created") || line.contains("Started") {
        LogKind::Success
    } else {
        LogKind::Info
    }
}

/// Drain compose output into the job log until the sender side closes
pub async fn pump_output(mut output: mpsc::Receiver<Vec<u8>>, job: &Job, idle_flush: Duration) {
    let mut coalescer = LineCoalescer::new();
    loop {
        match timeout(idle_flush, output.recv()).await {
            Ok(Some(chunk)) => {
                for line in coalescer.push(&chunk) {
                    job.append_log(classify_line(&line), line);
                }
            }
            Ok(None) => break,
            Err(_) => {
                if let Some(line) = coalescer.flush() {
                    job.append_log(classify_line(&line), line);
                }
            }
        }
    }
    if let Some(line) = coalescer.flush() {
        job.append_log(classify_line(&line), line);
    }
}
