//! Wire format of the session channel.
//!
//! Every frame, in both directions, is `{ "event": <name>, "data": <payload> }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::error::RelayError;

pub type EventSender = mpsc::Sender<ServerEvent>;

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRef {
    #[serde(alias = "selectedProfileName")]
    pub profile_name: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestTicketRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub send_direct_reply: bool,
    #[serde(default)]
    pub verify_email: bool,
    #[serde(default, alias = "selectedProfileName")]
    pub profile_name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BulkCreateRequest {
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub description: String,
    /// Seconds between items.
    #[serde(default)]
    pub delay: f64,
    #[serde(default)]
    pub send_direct_reply: bool,
    #[serde(default)]
    pub verify_email: bool,
    #[serde(default, alias = "selectedProfileName")]
    pub profile_name: String,
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    CheckApiStatus(ProfileRef),
    SendTestTicket(TestTicketRequest),
    StartBulkCreate(BulkCreateRequest),
    PauseJob(JobRef),
    ResumeJob(JobRef),
    EndJob(JobRef),
    GetEmailFailures(ProfileRef),
}

impl ClientCommand {
    pub fn parse(frame: &str) -> Result<Self, RelayError> {
        let envelope: Envelope = serde_json::from_str(frame)
            .map_err(|e| RelayError::Validation(format!("Malformed frame: {}", e)))?;
        let data = envelope.data;

        fn payload<T: for<'de> Deserialize<'de> + Default>(data: Value) -> Result<T, RelayError> {
            if data.is_null() {
                return Ok(T::default());
            }
            serde_json::from_value(data)
                .map_err(|e| RelayError::Validation(format!("Invalid payload: {}", e)))
        }
        fn required<T: for<'de> Deserialize<'de>>(data: Value) -> Result<T, RelayError> {
            serde_json::from_value(data)
                .map_err(|e| RelayError::Validation(format!("Invalid payload: {}", e)))
        }

        match envelope.event.as_str() {
            "checkApiStatus" => Ok(ClientCommand::CheckApiStatus(payload(data)?)),
            "sendTestTicket" => Ok(ClientCommand::SendTestTicket(required(data)?)),
            "startBulkCreate" => Ok(ClientCommand::StartBulkCreate(required(data)?)),
            "pauseJob" => Ok(ClientCommand::PauseJob(payload(data)?)),
            "resumeJob" => Ok(ClientCommand::ResumeJob(payload(data)?)),
            "endJob" => Ok(ClientCommand::EndJob(payload(data)?)),
            "getEmailFailures" => Ok(ClientCommand::GetEmailFailures(payload(data)?)),
            other => Err(RelayError::Validation(format!("Unknown event '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    ApiStatusResult {
        success: bool,
        message: String,
        full_response: Value,
    },
    TestTicketResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        ticket_number: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        full_response: Value,
    },
    TestTicketVerificationResult {
        success: bool,
        details: String,
        full_response: Value,
    },
    BulkStarted {
        job_id: String,
        total: usize,
    },
    TicketResult {
        job_id: String,
        email: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        ticket_number: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        full_response: Value,
    },
    TicketUpdate {
        job_id: String,
        ticket_number: String,
        success: bool,
        details: String,
        full_response: Value,
    },
    BulkComplete {
        job_id: String,
    },
    BulkEnded {
        job_id: String,
    },
    BulkError {
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        message: String,
    },
    EmailFailuresResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    CommandError {
        message: String,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ApiStatusResult { .. } => "apiStatusResult",
            ServerEvent::TestTicketResult { .. } => "testTicketResult",
            ServerEvent::TestTicketVerificationResult { .. } => "testTicketVerificationResult",
            ServerEvent::BulkStarted { .. } => "bulkStarted",
            ServerEvent::TicketResult { .. } => "ticketResult",
            ServerEvent::TicketUpdate { .. } => "ticketUpdate",
            ServerEvent::BulkComplete { .. } => "bulkComplete",
            ServerEvent::BulkEnded { .. } => "bulkEnded",
            ServerEvent::BulkError { .. } => "bulkError",
            ServerEvent::EmailFailuresResult { .. } => "emailFailuresResult",
            ServerEvent::CommandError { .. } => "commandError",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerEvent::BulkComplete { .. }
                | ServerEvent::BulkEnded { .. }
                | ServerEvent::BulkError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_start_command_with_profile_alias() {
        let frame = json!({
            "event": "startBulkCreate",
            "data": {
                "emails": ["a@example.com", " "],
                "subject": "Hi",
                "description": "Body",
                "delay": 1.5,
                "sendDirectReply": true,
                "selectedProfileName": "Support EU"
            }
        })
        .to_string();

        match ClientCommand::parse(&frame).unwrap() {
            ClientCommand::StartBulkCreate(req) => {
                assert_eq!(req.emails.len(), 2);
                assert_eq!(req.delay, 1.5);
                assert!(req.send_direct_reply);
                assert!(!req.verify_email);
                assert_eq!(req.profile_name, "Support EU");
                assert!(req.job_id.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn control_commands_accept_missing_data() {
        assert_eq!(
            ClientCommand::parse(r#"{"event":"pauseJob"}"#).unwrap(),
            ClientCommand::PauseJob(JobRef::default())
        );
        assert_eq!(
            ClientCommand::parse(r#"{"event":"endJob","data":{"jobId":"j-1"}}"#).unwrap(),
            ClientCommand::EndJob(JobRef {
                job_id: Some("j-1".to_string())
            })
        );
    }

    #[test]
    fn unknown_event_is_validation_error() {
        let err = ClientCommand::parse(r#"{"event":"dropTables","data":{}}"#).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        assert!(ClientCommand::parse("not json").is_err());
    }

    #[test]
    fn start_without_payload_is_rejected() {
        assert!(ClientCommand::parse(r#"{"event":"startBulkCreate"}"#).is_err());
    }

    #[test]
    fn events_serialize_as_tagged_camel_case() {
        let event = ServerEvent::TicketResult {
            job_id: "j".to_string(),
            email: "a@example.com".to_string(),
            success: true,
            ticket_number: Some("100".to_string()),
            error: None,
            details: None,
            full_response: json!({ "id": "1" }),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "ticketResult");
        assert_eq!(value["data"]["ticketNumber"], "100");
        assert_eq!(value["data"]["fullResponse"]["id"], "1");
        assert!(value["data"].get("error").is_none());
        assert_eq!(event.name(), "ticketResult");
    }

    #[test]
    fn terminal_events_are_flagged() {
        assert!(ServerEvent::BulkEnded { job_id: "j".into() }.is_terminal());
        assert!(
            !ServerEvent::CommandError {
                message: "x".into()
            }
            .is_terminal()
        );
    }
}
