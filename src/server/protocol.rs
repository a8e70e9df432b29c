//! JSON frames exchanged over `/ws`

use serde::{Deserialize, Serialize};

use crate::jobs::{DocumentJob, JobEvent, JobSnapshot, JobUpdate};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    StartJob {
        text: String,
        #[serde(default)]
        custom_instructions: Option<String>,
        #[serde(default)]
        audience_parameters: Option<String>,
        #[serde(default)]
        rigor_level: Option<String>,
    },
    AbortJob {
        job_id: String,
    },
    ResumeJob {
        job_id: String,
    },
    GetStatus {
        job_id: String,
    },
}

/// Replies that are not job events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    JobStatus(JobSnapshot),
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, job_id: Option<&str>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            job_id: job_id.map(str::to_string),
        }
    }
}

/// Completion event rebuilt from a stored job, for resumes served from the store
pub fn cached_completion(job: &DocumentJob) -> JobUpdate {
    let final_output = job.final_output.clone().unwrap_or_default();
    JobUpdate {
        job_id: job.id.clone(),
        event: JobEvent::JobComplete {
            final_word_count: job.final_word_count.unwrap_or(0),
            final_output,
            stitch_result: job.stitch_result.clone().unwrap_or_default(),
            validation: job.validation.clone().unwrap_or_default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_job() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "start_job", "text": "body", "customInstructions": "shorten to 2000 words", "rigorLevel": "high"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::StartJob {
                text: "body".into(),
                custom_instructions: Some("shorten to 2000 words".into()),
                audience_parameters: None,
                rigor_level: Some("high".into()),
            }
        );
    }

    #[test]
    fn test_parse_job_commands() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "abort_job", "jobId": "j1"}"#).unwrap();
        assert_eq!(msg, ClientMessage::AbortJob { job_id: "j1".into() });

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "get_status", "jobId": "j2"}"#).unwrap();
        assert_eq!(msg, ClientMessage::GetStatus { job_id: "j2".into() });
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "reboot"}"#).is_err());
    }

    #[test]
    fn test_error_frame_shape() {
        let value = serde_json::to_value(ServerMessage::error("bad", Some("j1"))).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "bad");
        assert_eq!(value["jobId"], "j1");

        let value = serde_json::to_value(ServerMessage::error("bad", None)).unwrap();
        assert!(value.get("jobId").is_none());
    }
}
