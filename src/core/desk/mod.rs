//! Outbound calls to the help-desk API.
//!
//! [`DeskGateway`] attaches a fresh bearer token and the organization header
//! to every request. The job controller only sees the [`DeskApi`] verbs.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::config::DeskConfig;
use crate::core::error::{RelayError, provider_message};
use crate::core::oauth::TokenCache;
use crate::core::profiles::Profile;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewTicket {
    pub subject: String,
    pub description: String,
    pub department_id: String,
    pub contact: TicketContact,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TicketContact {
    pub email: String,
}

impl NewTicket {
    pub fn for_recipient(profile: &Profile, subject: &str, description: &str, email: &str) -> Self {
        Self {
            subject: subject.to_string(),
            description: description.to_string(),
            department_id: profile.default_department_id.clone(),
            contact: TicketContact {
                email: email.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyDraft {
    pub channel: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_email_address: Option<String>,
    pub content_type: String,
    pub content: String,
}

impl ReplyDraft {
    pub fn email(profile: &Profile, to: &str, content: &str) -> Self {
        Self {
            channel: "EMAIL".to_string(),
            to: to.to_string(),
            from_email_address: profile.from_email_address.clone(),
            content_type: "html".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryFilter {
    Workflow,
    NotificationRule,
}

impl HistoryFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryFilter::Workflow => "WorkflowHistory",
            HistoryFilter::NotificationRule => "NotificationRuleHistory",
        }
    }
}

/// Verb-level contract with the ticketing system.
#[async_trait]
pub trait DeskApi: Send + Sync {
    async fn create_ticket(&self, profile: &Profile, ticket: &NewTicket) -> Result<Value, RelayError>;

    async fn send_reply(
        &self,
        profile: &Profile,
        ticket_id: &str,
        reply: &ReplyDraft,
    ) -> Result<Value, RelayError>;

    async fn ticket_history(
        &self,
        profile: &Profile,
        ticket_id: &str,
        filter: HistoryFilter,
    ) -> Result<Value, RelayError>;

    async fn email_failure_alerts(&self, profile: &Profile) -> Result<Value, RelayError>;

    async fn my_info(&self, profile: &Profile) -> Result<Value, RelayError>;

    /// Raw token grant for the profile, served from the cache when fresh.
    async fn token_info(&self, profile: &Profile) -> Result<Value, RelayError>;
}

pub struct DeskGateway {
    client: Client,
    tokens: Arc<TokenCache>,
    base_url: String,
    auth_scheme: String,
    org_header: String,
}

impl DeskGateway {
    pub fn new(client: Client, tokens: Arc<TokenCache>, config: &DeskConfig) -> Self {
        Self {
            client,
            tokens,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_scheme: config.auth_scheme.clone(),
            org_header: config.org_header.clone(),
        }
    }

    /// Shared HTTP client with the configured connect and request timeouts.
    pub fn build_client(config: &DeskConfig) -> Result<Client, RelayError> {
        Ok(Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?)
    }

    pub async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        profile: &Profile,
    ) -> Result<Value, RelayError> {
        let token = self.tokens.get_token(profile).await?;
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {} [profile {}]", method, url, profile.profile_name);

        let mut request = self
            .client
            .request(method, &url)
            .header(
                "Authorization",
                format!("{} {}", self.auth_scheme, token.access_token),
            )
            .header(self.org_header.as_str(), profile.org_id.as_str());
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let payload: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or_else(|_| serde_json::json!({ "raw": text }))
        };

        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate(&profile.profile_name).await;
        }
        if !status.is_success() {
            let message = provider_message(&payload).unwrap_or_else(|| "API Error".to_string());
            warn!("Desk API {} for {}: {}", status.as_u16(), path, message);
            return Err(RelayError::Remote {
                status: status.as_u16(),
                message,
                payload,
            });
        }
        Ok(payload)
    }

    fn ticket_path(ticket_id: &str, suffix: &str) -> String {
        format!("/tickets/{}{}", urlencoding::encode(ticket_id), suffix)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, RelayError> {
    serde_json::to_value(value).map_err(|e| RelayError::Validation(e.to_string()))
}

#[async_trait]
impl DeskApi for DeskGateway {
    async fn create_ticket(&self, profile: &Profile, ticket: &NewTicket) -> Result<Value, RelayError> {
        let body = to_json(ticket)?;
        self.call(Method::POST, "/tickets", &[], Some(&body), profile)
            .await
    }

    async fn send_reply(
        &self,
        profile: &Profile,
        ticket_id: &str,
        reply: &ReplyDraft,
    ) -> Result<Value, RelayError> {
        let body = to_json(reply)?;
        let path = Self::ticket_path(ticket_id, "/sendReply");
        self.call(Method::POST, &path, &[], Some(&body), profile)
            .await
    }

    async fn ticket_history(
        &self,
        profile: &Profile,
        ticket_id: &str,
        filter: HistoryFilter,
    ) -> Result<Value, RelayError> {
        let path = Self::ticket_path(ticket_id, "/History");
        self.call(
            Method::GET,
            &path,
            &[("eventFilter", filter.as_str())],
            None,
            profile,
        )
        .await
    }

    async fn email_failure_alerts(&self, profile: &Profile) -> Result<Value, RelayError> {
        self.call(
            Method::GET,
            "/emailFailureAlerts",
            &[("department", profile.default_department_id.as_str())],
            None,
            profile,
        )
        .await
    }

    async fn my_info(&self, profile: &Profile) -> Result<Value, RelayError> {
        self.call(Method::GET, "/myinfo", &[], None, profile).await
    }

    async fn token_info(&self, profile: &Profile) -> Result<Value, RelayError> {
        Ok(self.tokens.get_token(profile).await?.raw)
    }
}

/// Ticket number as a display string; providers send it as a string or number.
pub fn ticket_number(payload: &Value) -> Option<String> {
    json_id(payload.get("ticketNumber")?)
}

/// Internal ticket id used in follow-up paths (reply, history).
pub fn ticket_id(payload: &Value) -> Option<String> {
    payload.get("id").and_then(json_id)
}

fn json_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Event list from a history/listing response: a bare array or `{ "data": [...] }`.
pub fn event_list(payload: &Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}
