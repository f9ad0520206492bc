//! Shared helpers for unit tests: an in-process mock upstream server and a
//! canned desk implementation.

use axum::Router;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::core::desk::{DeskApi, HistoryFilter, NewTicket, ReplyDraft};
use crate::core::error::RelayError;
use crate::core::profiles::Profile;

pub(crate) struct MockServer {
    pub base_url: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockServer {
    pub(crate) async fn start(app: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
        Self {
            base_url: format!("http://{}", addr),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Desk stand-in with fixed, successful answers.
pub(crate) struct StaticDesk;

#[async_trait::async_trait]
impl DeskApi for StaticDesk {
    async fn create_ticket(&self, _profile: &Profile, _ticket: &NewTicket) -> Result<Value, RelayError> {
        Ok(json!({ "id": "t1", "ticketNumber": "100" }))
    }

    async fn send_reply(
        &self,
        _profile: &Profile,
        _ticket_id: &str,
        _reply: &ReplyDraft,
    ) -> Result<Value, RelayError> {
        Ok(json!({ "status": "SUCCESS" }))
    }

    async fn ticket_history(
        &self,
        _profile: &Profile,
        _ticket_id: &str,
        _filter: HistoryFilter,
    ) -> Result<Value, RelayError> {
        Ok(json!({ "data": [] }))
    }

    async fn email_failure_alerts(&self, profile: &Profile) -> Result<Value, RelayError> {
        Ok(json!({ "data": [{ "ticketNumber": "7", "departmentId": profile.default_department_id }] }))
    }

    async fn my_info(&self, _profile: &Profile) -> Result<Value, RelayError> {
        Ok(json!({ "firstName": "Agent" }))
    }

    async fn token_info(&self, _profile: &Profile) -> Result<Value, RelayError> {
        Ok(json!({ "access_token": "abc", "expires_in": 3600 }))
    }
}
