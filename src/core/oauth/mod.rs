use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::core::error::{RelayError, provider_message};
use crate::core::profiles::Profile;

/// Tokens are treated as expired this long before the provider says they are.
const EXPIRY_MARGIN_SECS: i64 = 60;
const DEFAULT_TTL_SECS: i64 = 3600;
/// Upper bound on how long a token is trusted, whatever `expires_in` says.
const MAX_TTL_SECS: i64 = 86_400;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub profile_name: String,
    pub access_token: String,
    pub expires_at: Instant,
    /// Full provider response, shown to the operator by the status probe.
    pub raw: Value,
}

impl CachedToken {
    pub fn is_fresh(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

/// Per-profile bearer token cache backed by the refresh-token grant.
pub struct TokenCache {
    client: Client,
    token_url: String,
    entries: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn new(client: Client, token_url: impl Into<String>) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached token if still fresh, otherwise a refreshed one. Two callers that
    /// miss at the same time both refresh; the later write wins.
    pub async fn get_token(&self, profile: &Profile) -> Result<CachedToken, RelayError> {
        if let Some(token) = self.cached(&profile.profile_name).await {
            return Ok(token);
        }

        let fresh = self.refresh(profile).await?;
        self.entries
            .lock()
            .await
            .insert(profile.profile_name.clone(), fresh.clone());
        Ok(fresh)
    }

    pub async fn cached(&self, profile_name: &str) -> Option<CachedToken> {
        self.entries
            .lock()
            .await
            .get(profile_name)
            .filter(|t| t.is_fresh())
            .cloned()
    }

    /// Drops the cached token so the next call refreshes it.
    pub async fn invalidate(&self, profile_name: &str) {
        self.entries.lock().await.remove(profile_name);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn refresh(&self, profile: &Profile) -> Result<CachedToken, RelayError> {
        let name = profile.profile_name.as_str();
        debug!("Refreshing access token for profile [{}]", name);

        let params = [
            ("refresh_token", profile.refresh_token.as_str()),
            ("client_id", profile.client_id.as_str()),
            ("client_secret", profile.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let auth_err = |detail: String, payload: Option<Value>| {
            error!("TOKEN_REFRESH_FAILED for {}: {}", name, detail);
            RelayError::Auth {
                profile: name.to_string(),
                detail,
                payload,
            }
        };

        let response = match self.client.post(&self.token_url).form(&params).send().await {
            Ok(r) => r,
            Err(e) => return Err(auth_err(format!("HTTP request failed: {}", e), None)),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return Err(auth_err(format!("Failed to read response body: {}", e), None)),
        };
        let raw: Value =
            serde_json::from_str(&body).unwrap_or_else(|_| serde_json::json!({ "raw": body }));

        if !status.is_success() {
            let detail = provider_message(&raw).unwrap_or_else(|| format!("HTTP {}", status));
            return Err(auth_err(detail, Some(raw)));
        }

        let token: TokenResponse = match serde_json::from_value(raw.clone()) {
            Ok(t) => t,
            Err(e) => {
                return Err(auth_err(
                    format!("Failed to parse token response: {}", e),
                    Some(raw),
                ));
            }
        };

        if let Some(error) = token.error {
            let detail = match token.error_description {
                Some(desc) => format!("{} - {}", error, desc),
                None => error,
            };
            return Err(auth_err(detail, Some(raw)));
        }

        let Some(access_token) = token.access_token.filter(|t| !t.is_empty()) else {
            return Err(auth_err(
                "Failed to retrieve a valid access token.".to_string(),
                Some(raw),
            ));
        };

        let ttl = token.expires_in.unwrap_or(DEFAULT_TTL_SECS);
        let lifetime = ttl
            .saturating_sub(EXPIRY_MARGIN_SECS)
            .clamp(0, MAX_TTL_SECS - EXPIRY_MARGIN_SECS) as u64;
        info!(
            "Access token refreshed for profile [{}] (valid for {}s)",
            name, lifetime
        );

        Ok(CachedToken {
            profile_name: name.to_string(),
            access_token,
            expires_at: Instant::now() + Duration::from_secs(lifetime),
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::profiles::test_profile;
    use crate::test_support::MockServer;
    use axum::{Form, Json, Router, extract::State, routing::post};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct TokenServerState {
        calls: Arc<AtomicUsize>,
        response: Value,
        status: axum::http::StatusCode,
    }

    async fn token_endpoint(
        State(state): State<TokenServerState>,
        Form(form): Form<HashMap<String, String>>,
    ) -> (axum::http::StatusCode, Json<Value>) {
        state.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(form.get("grant_type").map(String::as_str), Some("refresh_token"));
        assert_eq!(form.get("refresh_token").map(String::as_str), Some("1000.refresh"));
        (state.status, Json(state.response.clone()))
    }

    async fn token_server(
        status: axum::http::StatusCode,
        response: Value,
    ) -> (MockServer, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/oauth/v2/token", post(token_endpoint))
            .with_state(TokenServerState {
                calls: calls.clone(),
                response,
                status,
            });
        (MockServer::start(app).await, calls)
    }

    #[tokio::test]
    async fn second_lookup_reuses_cached_token() {
        let (server, calls) = token_server(
            axum::http::StatusCode::OK,
            json!({ "access_token": "tok-1", "expires_in": 3600, "api_domain": "x" }),
        )
        .await;
        let cache = TokenCache::new(Client::new(), server.url("/oauth/v2/token"));
        let profile = test_profile("main");

        let first = cache.get_token(&profile).await.unwrap();
        let second = cache.get_token(&profile).await.unwrap();

        assert_eq!(first.access_token, "tok-1");
        assert_eq!(second.access_token, "tok-1");
        assert_eq!(second.raw["api_domain"], "x");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_ttl_is_never_cached_as_fresh() {
        let (server, calls) = token_server(
            axum::http::StatusCode::OK,
            json!({ "access_token": "tok-short", "expires_in": 30 }),
        )
        .await;
        let cache = TokenCache::new(Client::new(), server.url("/oauth/v2/token"));
        let profile = test_profile("main");

        cache.get_token(&profile).await.unwrap();
        cache.get_token(&profile).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_body_with_ok_status_is_auth_error() {
        let (server, _calls) = token_server(
            axum::http::StatusCode::OK,
            json!({ "error": "invalid_code" }),
        )
        .await;
        let cache = TokenCache::new(Client::new(), server.url("/oauth/v2/token"));
        let profile = test_profile("main");

        let err = cache.get_token(&profile).await.unwrap_err();
        match &err {
            RelayError::Auth { detail, payload, .. } => {
                assert_eq!(detail, "invalid_code");
                assert_eq!(payload.as_ref().unwrap()["error"], "invalid_code");
            }
            other => panic!("expected auth error, got {:?}", other),
        }
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn http_failure_is_auth_error_and_not_cached() {
        let (server, _calls) = token_server(
            axum::http::StatusCode::BAD_REQUEST,
            json!({ "error": "invalid_client" }),
        )
        .await;
        let cache = TokenCache::new(Client::new(), server.url("/oauth/v2/token"));

        let err = cache.get_token(&test_profile("main")).await.unwrap_err();
        assert!(matches!(err, RelayError::Auth { .. }));
        assert!(cache.cached("main").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let (server, calls) = token_server(
            axum::http::StatusCode::OK,
            json!({ "access_token": "tok", "expires_in": 3600 }),
        )
        .await;
        let cache = TokenCache::new(Client::new(), server.url("/oauth/v2/token"));
        let profile = test_profile("main");

        cache.get_token(&profile).await.unwrap();
        cache.invalidate("main").await;
        cache.get_token(&profile).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn huge_expires_in_is_capped() {
        let (server, calls) = token_server(
            axum::http::StatusCode::OK,
            json!({ "access_token": "tok-forever", "expires_in": i64::MAX }),
        )
        .await;
        let cache = TokenCache::new(Client::new(), server.url("/oauth/v2/token"));
        let profile = test_profile("main");

        let token = cache.get_token(&profile).await.unwrap();
        assert!(token.expires_at <= Instant::now() + Duration::from_secs(MAX_TTL_SECS as u64));
        cache.get_token(&profile).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
