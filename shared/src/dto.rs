//! Defines the shared data transfer objects exchanged between services so
//! serialization stays consistent across the stack: the job record, its
//! status machine, and the JSON message envelopes carried on the bus.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Lifecycle status of an annotation job. Transitions are monotonic along
/// `PENDING -> RUNNING -> COMPLETED`; `FAILED` is terminal from any
/// non-terminal state.
#[derive(
    sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, Serialize, Deserialize,
)]
#[sqlx(type_name = "job_status", rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition(self, to: JobStatus) -> bool {
        match (self, to) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Running, JobStatus::Completed) => true,
            (JobStatus::Pending | JobStatus::Running, JobStatus::Failed) => true,
            _ => false,
        }
    }
}

/// One row of the `annotations` table.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub user_id: String,
    pub input_file_name: String,
    pub input_bucket: String,
    pub input_key: String,
    pub submit_time: i64,
    pub job_status: JobStatus,
    pub result_bucket: Option<String>,
    pub result_key: Option<String>,
    pub log_key: Option<String>,
    pub complete_time: Option<i64>,
    /// Cold-storage handle; presence means the hot result object was purged.
    pub results_file_archive_id: Option<String>,
}

/// Published by the intake when a job record has been persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmitted {
    pub job_id: String,
    pub user_id: String,
    pub input_bucket: String,
    pub input_key: String,
    pub input_file_name: String,
    pub submit_time: i64,
}

/// Published by the annotator once the result artifacts are in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: String,
    pub user_id: String,
    pub complete_time: i64,
}

/// Delivered to the archiver after the retention delay. `bucket`/`key`
/// address the hot result object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveScheduled {
    pub bucket: String,
    pub key: String,
    pub user_id: String,
    pub job_id: String,
}

/// Published for every archived job of a user who upgraded to premium.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThawRequested {
    pub user_id: String,
    pub archive_id: String,
    pub job_id: String,
}

/// Completion callback from the cold-storage layer. Field names follow its
/// wire format; `job_description` carries the application job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RetrievalReady {
    /// Retrieval job id in the cold-storage layer, not an annotation job id.
    pub job_id: String,
    pub archive_id: String,
    pub completed: bool,
    pub status_code: String,
    pub job_description: String,
}

/// Delay-queue envelope: consumers hold the inner message back until
/// `deliver_at` (epoch seconds) has passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scheduled {
    pub deliver_at: i64,
    pub message: String,
}

/// Body of an HTTP bus callback, either a subscription confirmation carrying
/// `SubscribeURL` or a notification carrying the inner payload in `Message`.
#[derive(Debug, Clone, Deserialize)]
pub struct BusCallback {
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
    #[serde(rename = "SubscribeURL", default)]
    pub subscribe_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_progression_is_monotonic() {
        assert!(JobStatus::Pending.can_transition(JobStatus::Running));
        assert!(JobStatus::Running.can_transition(JobStatus::Completed));
        assert!(!JobStatus::Running.can_transition(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition(JobStatus::Running));
        assert!(!JobStatus::Completed.can_transition(JobStatus::Failed));
    }

    #[test]
    fn failed_is_terminal_from_non_terminal_states() {
        assert!(JobStatus::Pending.can_transition(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition(JobStatus::Running));
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn status_serializes_as_uppercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Pending).unwrap(),
            "\"PENDING\""
        );
        assert_eq!("RUNNING".parse::<JobStatus>().unwrap(), JobStatus::Running);
    }

    #[test]
    fn retrieval_ready_uses_cold_layer_field_names() {
        let body = r#"{
            "JobId": "ret-1",
            "ArchiveId": "arch-1",
            "Completed": true,
            "StatusCode": "Succeeded",
            "JobDescription": "4c7e61b0f2aa4f0e8d1a22c9b81f3c55"
        }"#;
        let msg: RetrievalReady = serde_json::from_str(body).unwrap();
        assert_eq!(msg.job_id, "ret-1");
        assert_eq!(msg.status_code, "Succeeded");
        assert_eq!(msg.job_description, "4c7e61b0f2aa4f0e8d1a22c9b81f3c55");
    }
}
