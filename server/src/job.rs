use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Scheduled,
    Enqueued,
    Processing,
    Succeeded,
    Failed,
}

/// What a worker needs to run a job: target type, method, and serialized
/// arguments. All mutable state lives in Redis, not in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: String,
    pub target_type: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,

    pub queue: String,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub server: Option<String>,
    pub retries: i64,
    pub max_retries: i64,

    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_detail: Option<String>,
}

impl JobDescriptor {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "SCHEDULED",
            JobState::Enqueued => "ENQUEUED",
            JobState::Processing => "PROCESSING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SCHEDULED" => Some(JobState::Scheduled),
            "ENQUEUED" => Some(JobState::Enqueued),
            "PROCESSING" => Some(JobState::Processing),
            "SUCCEEDED" => Some(JobState::Succeeded),
            "FAILED" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Captured outcome of a failed invocation, recorded on the job hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub detail: Option<String>,
}

impl FailureInfo {
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            error_type: "HandlerError".to_string(),
            message: err.to_string(),
            detail: Some(format!("{err:#}")),
        }
    }

    pub fn panic(message: String) -> Self {
        Self {
            error_type: "Panic".to_string(),
            message,
            detail: None,
        }
    }

    pub fn handler_not_found(target_type: &str) -> Self {
        Self {
            error_type: "HandlerNotFound".to_string(),
            message: format!("no handler registered for '{target_type}'"),
            detail: None,
        }
    }
}
