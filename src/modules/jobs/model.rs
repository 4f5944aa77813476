use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// One entry of the resolution ladder, e.g. `1080p` at 1920x1080.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LadderRung {
    pub quality: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EncodePayload {
    pub content_id: Uuid,
    pub source_path: String,
    pub resolution_ladder: Vec<LadderRung>,
}

/// Work item carried by a job. Workers match on this exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Encode(EncodePayload),
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::Encode(_) => "encode",
        }
    }

    pub fn content_id(&self) -> Uuid {
        match self {
            JobPayload::Encode(p) => p.content_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Job {
    pub id: Uuid,
    pub payload: JobPayload,
    pub state: JobState,
    /// Number of times the job has been claimed by a worker.
    pub attempts: u32,
    pub max_attempts: u32,
    pub locked_by: Option<String>,
    #[schema(value_type = Option<String>, format = DateTime)]
    #[serde(with = "time::serde::rfc3339::option")]
    pub lock_until: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    #[schema(value_type = String, format = DateTime)]
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[schema(value_type = String, format = DateTime)]
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Job {
    pub fn new(payload: JobPayload, max_attempts: u32) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            payload,
            state: JobState::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            locked_by: None,
            lock_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn content_id(&self) -> Uuid {
        self.payload.content_id()
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.state == JobState::Active && self.locked_by.as_deref() == Some(worker_id)
    }
}

/// Result of `complete`. Completing twice is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    Completed,
    AlreadyCompleted,
}

/// Where a failed attempt left the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { attempts: u32 },
    Failed { attempts: u32 },
}

/// Raised on the operator channel whenever a job reaches `failed`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OperatorAlert {
    pub job_id: Uuid,
    pub content_id: Uuid,
    pub attempts: u32,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_tagged_by_type() {
        let payload = JobPayload::Encode(EncodePayload {
            content_id: Uuid::nil(),
            source_path: "sources/x.src".into(),
            resolution_ladder: vec![LadderRung {
                quality: "720p".into(),
                width: 1280,
                height: 720,
            }],
        });

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "encode");
        assert_eq!(json["resolution_ladder"][0]["quality"], "720p");

        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn unknown_payload_type_is_rejected() {
        let raw = serde_json::json!({ "type": "thumbnail", "content_id": Uuid::nil() });
        assert!(serde_json::from_value::<JobPayload>(raw).is_err());
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let payload = JobPayload::Encode(EncodePayload {
            content_id: Uuid::nil(),
            source_path: String::new(),
            resolution_ladder: vec![],
        });
        assert_eq!(Job::new(payload, 0).max_attempts, 1);
    }
}
