//! Process-wide job table

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::jobs::job::{Job, JobStatus};

/// Owns every job created during this process lifetime
pub struct JobRegistry {
    jobs: Mutex<RegistryInner>,
    log_capacity: usize,
}

struct RegistryInner {
    jobs: HashMap<String, Arc<Job>>,
    last_id: i64,
}

impl JobRegistry {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(RegistryInner {
                jobs: HashMap::new(),
                last_id: 0,
            }),
            log_capacity,
        }
    }

    /// Create a pending job with an empty log
    pub fn create_job(&self, kind: &str) -> Arc<Job> {
        let mut inner = self.jobs.lock().unwrap_or_else(|e| e.into_inner());

        // time-derived, bumped when two jobs land on the same clock reading
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(inner.last_id + 1);
        let id = now.max(inner.last_id + 1);
        inner.last_id = id;

        let job = Arc::new(Job::new(id.to_string(), kind, self.log_capacity));
        inner.jobs.insert(job.id().to_string(), job.clone());
        debug!("Created {} job {}", kind, job.id());
        job
    }

    pub fn get_job(&self, id: &str) -> Option<Arc<Job>> {
        let inner = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        inner.jobs.get(id).cloned()
    }

    /// Jobs matching the given kinds and statuses (empty filter matches all),
    /// newest first
    pub fn list(&self, kinds: &[String], statuses: &[JobStatus]) -> Vec<Arc<Job>> {
        let jobs: Vec<Arc<Job>> = {
            let inner = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            inner.jobs.values().cloned().collect()
        };

        let mut jobs: Vec<Arc<Job>> = jobs
            .into_iter()
            .filter(|job| kinds.is_empty() || kinds.iter().any(|k| k == job.kind()))
            .filter(|job| statuses.is_empty() || statuses.contains(&job.status()))
            .collect();
        jobs.sort_by(|a, b| b.created_at().cmp(&a.created_at()).then(b.id().cmp(a.id())));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
