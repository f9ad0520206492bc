//! Drives bulk ticket jobs.
//!
//! Each job runs in its own task and re-reads its status from the registry at
//! every checkpoint: before an item, after a pause, after the inter-item delay.
//! Cancellation is cooperative, so a request already sent upstream always
//! finishes and its result is still emitted.
//!
//! Verification of sent emails runs as detached tasks that report back
//! through the same event channel.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::config::JobTimingConfig;
use crate::core::desk::{
    DeskApi, HistoryFilter, NewTicket, ReplyDraft, event_list, ticket_id, ticket_number,
};
use crate::core::error::RelayError;
use crate::core::events::{BulkCreateRequest, EventSender, ServerEvent, TestTicketRequest};
use crate::core::jobs::{JobConfig, JobRegistry, JobSnapshot, JobStatus};
use crate::core::profiles::Profile;

#[derive(Debug, Clone, Copy)]
pub struct JobTiming {
    pub pause_poll: Duration,
    pub sleep_tick: Duration,
    pub verify_delay: Duration,
}

impl From<&JobTimingConfig> for JobTiming {
    fn from(config: &JobTimingConfig) -> Self {
        Self {
            pause_poll: config.pause_poll(),
            sleep_tick: config.sleep_tick(),
            verify_delay: config.verify_delay(),
        }
    }
}

impl JobConfig {
    pub fn from_request(request: &BulkCreateRequest, profile: Arc<Profile>) -> Result<Self, RelayError> {
        if request.emails.iter().all(|e| e.trim().is_empty()) {
            return Err(RelayError::Validation("No recipients provided.".to_string()));
        }
        let delay = Duration::try_from_secs_f64(request.delay)
            .map_err(|_| RelayError::Validation(format!("Invalid delay: {}", request.delay)))?;
        Ok(Self {
            recipients: request.emails.clone(),
            subject: request.subject.clone(),
            description: request.description.clone(),
            delay,
            send_direct_reply: request.send_direct_reply,
            verify_email: request.verify_email,
            profile,
        })
    }
}

/// Result of create (+ optional reply) for one recipient.
#[derive(Debug, Clone)]
struct ItemOutcome {
    success: bool,
    ticket_number: Option<String>,
    ticket_id: Option<String>,
    error: Option<String>,
    details: Option<String>,
    full_response: Value,
}

impl ItemOutcome {
    fn created(&self) -> bool {
        self.ticket_id.is_some() || self.ticket_number.is_some()
    }
}

#[derive(Debug, Clone)]
struct VerificationOutcome {
    success: bool,
    details: String,
    full_response: Value,
}

impl VerificationOutcome {
    fn missing_id() -> Self {
        Self {
            success: false,
            details: "Verification failed: no ticket id".to_string(),
            full_response: Value::Null,
        }
    }
}

#[derive(Clone)]
pub struct BulkController {
    registry: JobRegistry,
    api: Arc<dyn DeskApi>,
    timing: JobTiming,
}

async fn emit(events: &EventSender, event: ServerEvent) {
    let name = event.name();
    if events.send(event).await.is_err() {
        debug!("Session closed, dropping {} event", name);
    }
}

impl BulkController {
    pub fn new(registry: JobRegistry, api: Arc<dyn DeskApi>, timing: JobTiming) -> Self {
        Self {
            registry,
            api,
            timing,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn api(&self) -> &Arc<dyn DeskApi> {
        &self.api
    }

    /// Registers the job and runs it in the background. `bulkStarted` is the
    /// first event the job task emits, so callers never block on the channel.
    pub async fn start_job(
        &self,
        job_id: String,
        owner: &str,
        config: JobConfig,
        events: EventSender,
    ) -> Result<JobSnapshot, RelayError> {
        let config = Arc::new(config);
        let snapshot = self.registry.create(&job_id, owner, config.clone()).await?;
        info!(
            "[{}] Bulk job started: {} recipients, profile [{}], delay {:?}",
            job_id,
            snapshot.total,
            config.profile.profile_name,
            config.delay
        );

        let controller = self.clone();
        let total = snapshot.total;
        tokio::spawn(async move {
            emit(
                &events,
                ServerEvent::BulkStarted {
                    job_id: job_id.clone(),
                    total,
                },
            )
            .await;
            controller.run_job(job_id, config, events).await;
        });
        Ok(snapshot)
    }

    pub async fn pause_job(&self, job_id: &str) -> bool {
        let paused = self.registry.status(job_id).await == Some(JobStatus::Running)
            && self.registry.set_status(job_id, JobStatus::Paused).await;
        if paused {
            info!("[{}] Paused", job_id);
        }
        paused
    }

    pub async fn resume_job(&self, job_id: &str) -> bool {
        let resumed = self.registry.status(job_id).await == Some(JobStatus::Paused)
            && self.registry.set_status(job_id, JobStatus::Running).await;
        if resumed {
            info!("[{}] Resumed", job_id);
        }
        resumed
    }

    pub async fn end_job(&self, job_id: &str) -> bool {
        let ended = self.registry.set_status(job_id, JobStatus::Ended).await;
        if ended {
            info!("[{}] End requested", job_id);
        }
        ended
    }

    /// Ends every job a session owns; used when the session disconnects.
    pub async fn end_jobs_owned_by(&self, owner: &str) -> usize {
        let mut count = 0;
        for job_id in self.registry.owned_by(owner).await {
            if self.end_job(&job_id).await {
                count += 1;
            }
        }
        count
    }

    /// Waits until no job is registered. Returns false if `timeout` ran out first.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.registry.list().await.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.timing.sleep_tick).await;
        }
    }

    /// Runs the item loop in a child task so that a panic inside it is reported
    /// as a job-level error, then emits the single terminal event.
    async fn run_job(&self, job_id: String, config: Arc<JobConfig>, events: EventSender) {
        let worker = {
            let controller = self.clone();
            let job_id = job_id.clone();
            let config = config.clone();
            let events = events.clone();
            tokio::spawn(async move { controller.process_items(&job_id, &config, &events).await })
        };

        let critical = match worker.await {
            Ok(()) => None,
            Err(e) if e.is_panic() => Some(RelayError::Critical("job task panicked".to_string())),
            Err(_) => Some(RelayError::Critical("job task was cancelled".to_string())),
        };

        self.finalize(&job_id, critical, &events).await;
    }

    async fn finalize(&self, job_id: &str, critical: Option<RelayError>, events: &EventSender) {
        let Some(snapshot) = self.registry.remove(job_id).await else {
            return;
        };
        let event = match critical {
            Some(err) => {
                error!("[{}] {}", job_id, err);
                ServerEvent::BulkError {
                    job_id: Some(job_id.to_string()),
                    message: err.to_string(),
                }
            }
            None if snapshot.status == JobStatus::Ended => {
                info!(
                    "[{}] Ended by request after {}/{} items",
                    job_id, snapshot.cursor, snapshot.total
                );
                ServerEvent::BulkEnded {
                    job_id: job_id.to_string(),
                }
            }
            None => {
                info!("[{}] Completed {} items", job_id, snapshot.total);
                ServerEvent::BulkComplete {
                    job_id: job_id.to_string(),
                }
            }
        };
        emit(events, event).await;
    }

    async fn process_items(&self, job_id: &str, config: &JobConfig, events: &EventSender) {
        let profile = config.profile.as_ref();

        for (i, recipient) in config.recipients.iter().enumerate() {
            if !self.checkpoint(job_id).await || !self.wait_while_paused(job_id).await {
                break;
            }

            let email = recipient.trim();
            if email.is_empty() {
                self.registry.set_cursor(job_id, i + 1).await;
                continue;
            }

            if i > 0 && !config.delay.is_zero() {
                if !self.interruptible_sleep(job_id, config.delay).await {
                    break;
                }
                // Honour a pause requested during the delay.
                if !self.wait_while_paused(job_id).await {
                    break;
                }
            }

            let outcome = create_with_reply(
                self.api.as_ref(),
                profile,
                &config.subject,
                &config.description,
                email,
                config.send_direct_reply,
            )
            .await;

            if outcome.success {
                debug!("[{}] #{} {} ok", job_id, i, email);
            } else {
                warn!(
                    "[{}] #{} {} failed: {}",
                    job_id,
                    i,
                    email,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            }

            let verify_target = (config.verify_email && outcome.created())
                .then(|| (outcome.ticket_id.clone(), outcome.ticket_number.clone()));

            emit(
                events,
                ServerEvent::TicketResult {
                    job_id: job_id.to_string(),
                    email: email.to_string(),
                    success: outcome.success,
                    ticket_number: outcome.ticket_number,
                    error: outcome.error,
                    details: outcome.details,
                    full_response: outcome.full_response,
                },
            )
            .await;

            if let Some((id, number)) = verify_target {
                self.spawn_ticket_verification(job_id, config, id, number, events.clone());
            }

            self.registry.set_cursor(job_id, i + 1).await;
        }
    }

    async fn checkpoint(&self, job_id: &str) -> bool {
        matches!(
            self.registry.status(job_id).await,
            Some(JobStatus::Running | JobStatus::Paused)
        )
    }

    /// Returns false if the job ended (or vanished) while paused.
    async fn wait_while_paused(&self, job_id: &str) -> bool {
        loop {
            match self.registry.status(job_id).await {
                Some(JobStatus::Running) => return true,
                Some(JobStatus::Paused) => tokio::time::sleep(self.timing.pause_poll).await,
                Some(JobStatus::Ended) | None => return false,
            }
        }
    }

    /// Sleeps in ticks so an end request is noticed within one tick.
    async fn interruptible_sleep(&self, job_id: &str, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if !self.checkpoint(job_id).await {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep(self.timing.sleep_tick.min(deadline - now)).await;
        }
    }

    fn spawn_ticket_verification(
        &self,
        job_id: &str,
        config: &JobConfig,
        ticket_id: Option<String>,
        ticket_number: Option<String>,
        events: EventSender,
    ) {
        let correlation = ticket_number
            .or_else(|| ticket_id.clone())
            .unwrap_or_default();
        let api = self.api.clone();
        let profile = config.profile.clone();
        let delay = self.timing.verify_delay;
        let job_id = job_id.to_string();

        tokio::spawn(async move {
            let result = match ticket_id {
                Some(id) => verify_ticket(api.as_ref(), &profile, &id, delay).await,
                None => {
                    warn!("[{}] Ticket #{} has no id, cannot verify", job_id, correlation);
                    VerificationOutcome::missing_id()
                }
            };
            debug!("[{}] Verification for #{}: {}", job_id, correlation, result.details);
            emit(
                &events,
                ServerEvent::TicketUpdate {
                    job_id,
                    ticket_number: correlation,
                    success: result.success,
                    details: result.details,
                    full_response: result.full_response,
                },
            )
            .await;
        });
    }

    /// Single create (+ reply) (+ verify) without a registry entry.
    pub async fn send_test_ticket(
        &self,
        request: &TestTicketRequest,
        profile: Arc<Profile>,
        events: &EventSender,
    ) {
        let email = request.email.trim();
        let outcome = create_with_reply(
            self.api.as_ref(),
            &profile,
            &request.subject,
            &request.description,
            email,
            request.send_direct_reply,
        )
        .await;
        info!(
            "Test ticket to {} via [{}]: {}",
            email,
            profile.profile_name,
            if outcome.success { "ok" } else { "failed" }
        );

        let verify_target =
            (request.verify_email && outcome.created()).then(|| outcome.ticket_id.clone());

        emit(
            events,
            ServerEvent::TestTicketResult {
                success: outcome.success,
                ticket_number: outcome.ticket_number,
                error: outcome.error,
                full_response: outcome.full_response,
            },
        )
        .await;

        if let Some(ticket_id) = verify_target {
            let api = self.api.clone();
            let profile = profile.clone();
            let delay = self.timing.verify_delay;
            let events = events.clone();
            tokio::spawn(async move {
                let result = match ticket_id {
                    Some(id) => verify_ticket(api.as_ref(), &profile, &id, delay).await,
                    None => VerificationOutcome::missing_id(),
                };
                emit(
                    &events,
                    ServerEvent::TestTicketVerificationResult {
                        success: result.success,
                        details: result.details,
                        full_response: result.full_response,
                    },
                )
                .await;
            });
        }
    }
}

async fn create_with_reply(
    api: &dyn DeskApi,
    profile: &Profile,
    subject: &str,
    description: &str,
    email: &str,
    send_reply: bool,
) -> ItemOutcome {
    let ticket = NewTicket::for_recipient(profile, subject, description, email);
    let created = match api.create_ticket(profile, &ticket).await {
        Ok(payload) => payload,
        Err(e) => {
            return ItemOutcome {
                success: false,
                ticket_number: None,
                ticket_id: None,
                error: Some(e.user_message()),
                details: None,
                full_response: e.full_response(),
            };
        }
    };

    let number = ticket_number(&created);
    let id = ticket_id(&created);
    let label = number.as_deref().unwrap_or("?").to_string();

    if !send_reply {
        return ItemOutcome {
            success: true,
            ticket_number: number,
            ticket_id: id,
            error: None,
            details: Some(format!("Ticket #{} created", label)),
            full_response: created,
        };
    }

    let Some(reply_target) = id.clone() else {
        return ItemOutcome {
            success: false,
            ticket_number: number,
            ticket_id: None,
            error: Some("Ticket created, but reply failed: no ticket id in response".to_string()),
            details: Some(format!("Ticket #{} created; reply not sent", label)),
            full_response: json!({ "ticketCreate": created, "sendReply": Value::Null }),
        };
    };

    let reply = ReplyDraft::email(profile, email, description);
    match api.send_reply(profile, &reply_target, &reply).await {
        Ok(sent) => ItemOutcome {
            success: true,
            ticket_number: number,
            ticket_id: id,
            error: None,
            details: Some(format!("Ticket #{} created and reply sent", label)),
            full_response: json!({ "ticketCreate": created, "sendReply": sent }),
        },
        Err(e) => ItemOutcome {
            success: false,
            ticket_number: number,
            ticket_id: id,
            error: Some(format!("Ticket created, but reply failed: {}", e.user_message())),
            details: Some(format!("Ticket #{} created; reply not sent", label)),
            full_response: json!({ "ticketCreate": created, "sendReply": e.full_response() }),
        },
    }
}

async fn verify_ticket(
    api: &dyn DeskApi,
    profile: &Profile,
    ticket_id: &str,
    delay: Duration,
) -> VerificationOutcome {
    tokio::time::sleep(delay).await;

    let (workflow, notification) = tokio::join!(
        api.ticket_history(profile, ticket_id, HistoryFilter::Workflow),
        api.ticket_history(profile, ticket_id, HistoryFilter::NotificationRule),
    );

    match (workflow, notification) {
        (Ok(workflow), Ok(notification)) => {
            let events: Vec<Value> = event_list(&workflow)
                .into_iter()
                .chain(event_list(&notification))
                .collect();
            let sent = !events.is_empty();
            let details = if sent {
                format!("Email Sent: {} automation event(s) found", events.len())
            } else {
                "Not Found: no workflow or notification rule events for this ticket".to_string()
            };
            VerificationOutcome {
                success: sent,
                details,
                full_response: json!({
                    "workflowHistory": workflow,
                    "notificationHistory": notification,
                }),
            }
        }
        (workflow, notification) => {
            let reason = [&workflow, &notification]
                .iter()
                .find_map(|r| r.as_ref().err())
                .map(|e| e.user_message())
                .unwrap_or_default();
            let as_payload = |r: Result<Value, RelayError>| match r {
                Ok(v) => v,
                Err(e) => e.full_response(),
            };
            VerificationOutcome {
                success: false,
                details: format!("Verification failed: {}", reason),
                full_response: json!({
                    "workflowHistory": as_payload(workflow),
                    "notificationHistory": as_payload(notification),
                }),
            }
        }
    }
}
