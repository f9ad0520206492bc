use std::sync::Arc;
use std::time::Duration;

use crate::core::profiles::Profile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Paused,
    Ended,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Ended => "ended",
        }
    }
}

/// Everything a job needs, frozen when the start command arrives.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub recipients: Vec<String>,
    pub subject: String,
    pub description: String,
    pub delay: Duration,
    pub send_direct_reply: bool,
    pub verify_email: bool,
    pub profile: Arc<Profile>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub owner: String,
    pub status: JobStatus,
    pub cursor: usize,
    pub total: usize,
    pub profile_name: String,
}
