mod controller;
pub mod types;

pub use controller::{BulkController, JobTiming};
pub use types::{JobConfig, JobSnapshot, JobStatus};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::error::RelayError;

pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    if from == to {
        return true;
    }
    match from {
        JobStatus::Running => matches!(to, JobStatus::Paused | JobStatus::Ended),
        JobStatus::Paused => matches!(to, JobStatus::Running | JobStatus::Ended),
        JobStatus::Ended => false,
    }
}

struct JobEntry {
    owner: String,
    status: JobStatus,
    cursor: usize,
    config: Arc<JobConfig>,
}

impl JobEntry {
    fn snapshot(&self, job_id: &str) -> JobSnapshot {
        JobSnapshot {
            job_id: job_id.to_string(),
            owner: self.owner.clone(),
            status: self.status,
            cursor: self.cursor,
            total: self.config.recipients.len(),
            profile_name: self.config.profile.profile_name.clone(),
        }
    }
}

/// Active jobs keyed by job id. Absence of an id means "not running".
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(
        &self,
        job_id: &str,
        owner: &str,
        config: Arc<JobConfig>,
    ) -> Result<JobSnapshot, RelayError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(job_id) {
            return Err(RelayError::Validation(format!(
                "Job '{}' is already running.",
                job_id
            )));
        }
        let entry = JobEntry {
            owner: owner.to_string(),
            status: JobStatus::Running,
            cursor: 0,
            config,
        };
        let snapshot = entry.snapshot(job_id);
        jobs.insert(job_id.to_string(), entry);
        Ok(snapshot)
    }

    pub async fn get(&self, job_id: &str) -> Option<JobSnapshot> {
        self.jobs
            .lock()
            .await
            .get(job_id)
            .map(|e| e.snapshot(job_id))
    }

    pub async fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.lock().await.get(job_id).map(|e| e.status)
    }

    /// Applies the transition if the job exists and the move is allowed.
    pub async fn set_status(&self, job_id: &str, status: JobStatus) -> bool {
        let mut jobs = self.jobs.lock().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            return false;
        };
        if !can_transition(entry.status, status) {
            debug!(
                "Ignoring {} -> {} for job {}",
                entry.status.as_str(),
                status.as_str(),
                job_id
            );
            return false;
        }
        entry.status = status;
        true
    }

    pub async fn set_cursor(&self, job_id: &str, cursor: usize) {
        if let Some(entry) = self.jobs.lock().await.get_mut(job_id) {
            entry.cursor = cursor;
        }
    }

    pub async fn remove(&self, job_id: &str) -> Option<JobSnapshot> {
        self.jobs
            .lock()
            .await
            .remove(job_id)
            .map(|e| e.snapshot(job_id))
    }

    pub async fn owned_by(&self, owner: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn list(&self) -> Vec<JobSnapshot> {
        let mut out: Vec<JobSnapshot> = self
            .jobs
            .lock()
            .await
            .iter()
            .map(|(id, e)| e.snapshot(id))
            .collect();
        out.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        out
    }
}
