//! One websocket connection = one session.
//!
//! Inbound frames are parsed into commands. Anything that talks to the desk
//! runs in its own task and answers through the session's event channel, so
//! the socket loop is always free to flush outbound events.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::json;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::core::desk::DeskApi;
use crate::core::error::RelayError;
use crate::core::events::{
    BulkCreateRequest, ClientCommand, EventSender, JobRef, ServerEvent, TestTicketRequest,
};
use crate::core::jobs::JobConfig;
use crate::core::profiles::{Profile, ProfileStore};

const OUTBOUND_BUFFER: usize = 128;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(OUTBOUND_BUFFER);
    let session = Session::new(state, tx);
    info!("[{}] Session connected", session.id());

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("[{}] Websocket error: {}", session.id(), e);
                        break;
                    }
                };
                if let Some(reply) = session.handle_frame(text.as_str()).await
                    && send_event(&mut socket, &reply).await.is_err()
                {
                    break;
                }
            }
            Some(event) = rx.recv() => {
                if event.is_terminal() {
                    debug!("[{}] {}", session.id(), event.name());
                }
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    session.close().await;
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to serialize {}: {}", event.name(), e);
            return Ok(());
        }
    };
    socket.send(Message::Text(text.into())).await
}

#[derive(Debug, Clone, Copy)]
enum JobAction {
    Pause,
    Resume,
    End,
}

pub(crate) struct Session {
    id: String,
    state: AppState,
    events: EventSender,
}

impl Session {
    pub(crate) fn new(state: AppState, events: EventSender) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state,
            events,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Handles one inbound frame. A returned event must be written back
    /// directly; everything else arrives through the event channel.
    pub(crate) async fn handle_frame(&self, frame: &str) -> Option<ServerEvent> {
        let command = match ClientCommand::parse(frame) {
            Ok(command) => command,
            Err(e) => {
                warn!("[{}] Rejected frame: {}", self.id, e);
                return Some(ServerEvent::CommandError {
                    message: e.user_message(),
                });
            }
        };
        debug!("[{}] {:?}", self.id, command);
        self.dispatch(command).await
    }

    async fn dispatch(&self, command: ClientCommand) -> Option<ServerEvent> {
        let api = self.state.controller.api().clone();
        let profiles = self.state.profiles.clone();
        match command {
            ClientCommand::CheckApiStatus(target) => {
                self.reply_later(async move {
                    check_api_status(api.as_ref(), &profiles, &target.profile_name).await
                });
            }
            ClientCommand::GetEmailFailures(target) => {
                self.reply_later(async move {
                    email_failures(api.as_ref(), &profiles, &target.profile_name).await
                });
            }
            ClientCommand::SendTestTicket(request) => self.send_test_ticket(request),
            ClientCommand::StartBulkCreate(request) => {
                let job_id = request.job_id.clone();
                if let Err(e) = self.start_bulk(request).await {
                    warn!("[{}] Bulk job rejected: {}", self.id, e);
                    return Some(ServerEvent::BulkError {
                        job_id,
                        message: e.user_message(),
                    });
                }
            }
            ClientCommand::PauseJob(job) => self.control(job, JobAction::Pause).await,
            ClientCommand::ResumeJob(job) => self.control(job, JobAction::Resume).await,
            ClientCommand::EndJob(job) => self.control(job, JobAction::End).await,
        }
        None
    }

    fn reply_later<F>(&self, task: F)
    where
        F: Future<Output = ServerEvent> + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = events.send(task.await).await;
        });
    }

    fn send_test_ticket(&self, request: TestTicketRequest) {
        let controller = self.state.controller.clone();
        let profile = resolve_profile(&self.state.profiles, &request.profile_name);
        let events = self.events.clone();

        tokio::spawn(async move {
            let profile = match profile {
                Ok(profile) if !request.email.trim().is_empty() => profile,
                Ok(_) => {
                    let _ = events.send(test_ticket_failure("Recipient email is required.")).await;
                    return;
                }
                Err(e) => {
                    let _ = events.send(test_ticket_failure(&e.user_message())).await;
                    return;
                }
            };
            controller.send_test_ticket(&request, profile, &events).await;
        });
    }

    async fn start_bulk(&self, request: BulkCreateRequest) -> Result<(), RelayError> {
        let profile = resolve_profile(&self.state.profiles, &request.profile_name)?;
        let config = JobConfig::from_request(&request, profile)?;
        let job_id = request
            .job_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("{}-{}", self.id, Utc::now().timestamp_millis()));

        self.state
            .controller
            .start_job(job_id, &self.id, config, self.events.clone())
            .await?;
        Ok(())
    }

    /// With a job id the action targets that job; without one, every job
    /// this session owns.
    async fn control(&self, job: JobRef, action: JobAction) {
        let controller = &self.state.controller;
        let targets = match job.job_id {
            Some(id) => vec![id],
            None => controller.registry().owned_by(&self.id).await,
        };
        for job_id in targets {
            let applied = match action {
                JobAction::Pause => controller.pause_job(&job_id).await,
                JobAction::Resume => controller.resume_job(&job_id).await,
                JobAction::End => controller.end_job(&job_id).await,
            };
            if !applied {
                debug!("[{}] {:?} had no effect on {}", self.id, action, job_id);
            }
        }
    }

    /// Ends every job this session owns.
    pub(crate) async fn close(&self) {
        let ended = self.state.controller.end_jobs_owned_by(&self.id).await;
        info!("[{}] Session closed, ended {} job(s)", self.id, ended);
    }
}

fn resolve_profile(
    profiles: &ProfileStore,
    name: &str,
) -> Result<std::sync::Arc<Profile>, RelayError> {
    profiles
        .get(name)
        .ok_or_else(|| RelayError::Validation(format!("Profile '{}' not found.", name)))
}

fn test_ticket_failure(message: &str) -> ServerEvent {
    ServerEvent::TestTicketResult {
        success: false,
        ticket_number: None,
        error: Some(message.to_string()),
        full_response: json!({ "error": message }),
    }
}

/// Token check followed by an identity probe. A failed identity call is
/// reported inside `fullResponse` but does not fail the check.
async fn check_api_status(api: &dyn DeskApi, profiles: &ProfileStore, name: &str) -> ServerEvent {
    let failed = |e: RelayError| ServerEvent::ApiStatusResult {
        success: false,
        message: format!("Connection failed: {}", e.user_message()),
        full_response: e.full_response(),
    };

    let profile = match resolve_profile(profiles, name) {
        Ok(profile) => profile,
        Err(e) => return failed(e),
    };
    let token = match api.token_info(&profile).await {
        Ok(token) => token,
        Err(e) => return failed(e),
    };
    let agent = match api.my_info(&profile).await {
        Ok(info) => info,
        Err(e) => {
            warn!("Identity probe for [{}] failed: {}", name, e);
            json!({ "error": e.user_message(), "details": e.full_response() })
        }
    };

    ServerEvent::ApiStatusResult {
        success: true,
        message: "Token is valid. Connection to the help desk API is successful.".to_string(),
        full_response: json!({ "token": token, "agentInfo": agent }),
    }
}

async fn email_failures(api: &dyn DeskApi, profiles: &ProfileStore, name: &str) -> ServerEvent {
    let result = match resolve_profile(profiles, name) {
        Ok(profile) => api.email_failure_alerts(&profile).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(data) => ServerEvent::EmailFailuresResult {
            success: true,
            data: Some(data),
            error: None,
        },
        Err(e) => ServerEvent::EmailFailuresResult {
            success: false,
            data: None,
            error: Some(e.user_message()),
        },
    }
}
