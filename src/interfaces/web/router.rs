use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tracing::warn;

use super::AppState;
use super::handlers;
use super::session;

fn build_cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", o);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/api/profiles", get(handlers::get_profiles))
        .route("/api/jobs", get(handlers::get_jobs))
        .route("/api/logs", get(super::sse_logs_endpoint))
        .route("/ws", get(session::ws_handler))
        .layer(middleware::from_fn(security_headers))
        .layer(build_cors(allowed_origins))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::jobs::{JobConfig, JobStatus};
    use crate::core::profiles::test_profile;
    use crate::interfaces::web::test_state;
    use axum::http::StatusCode;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn origins() -> Vec<String> {
        vec!["http://localhost:8080".to_string()]
    }

    async fn get_json(app: Router, path: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let app = build_api_router(test_state(), &origins());
        let req = Request::builder()
            .uri("/api/profiles")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
        assert!(resp.headers().contains_key("content-security-policy"));
    }

    #[tokio::test]
    async fn profiles_are_listed_without_credentials() {
        let app = build_api_router(test_state(), &origins());
        let (status, json) = get_json(app, "/api/profiles").await;

        assert_eq!(status, StatusCode::OK);
        let list = json.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["profileName"], "main");
        assert_eq!(list[0]["defaultDepartmentId"], "4000000007");
        let text = json.to_string();
        assert!(!text.contains("refresh"));
        assert!(!text.contains("s3cret"));
        assert!(!text.contains("1000.CLIENT"));
    }

    #[tokio::test]
    async fn jobs_endpoint_reports_registry() {
        let state = test_state();
        let app = build_api_router(state.clone(), &origins());
        let (_, empty) = get_json(app.clone(), "/api/jobs").await;
        assert_eq!(empty, serde_json::json!([]));

        let config = JobConfig {
            recipients: vec!["a@example.com".to_string(), "b@example.com".to_string()],
            subject: "s".to_string(),
            description: "d".to_string(),
            delay: Duration::ZERO,
            send_direct_reply: false,
            verify_email: false,
            profile: Arc::new(test_profile("main")),
        };
        let registry = state.controller.registry();
        registry.create("job-7", "session-1", Arc::new(config)).await.unwrap();
        registry.set_status("job-7", JobStatus::Paused).await;

        let (status, json) = get_json(app, "/api/jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["jobId"], "job-7");
        assert_eq!(json[0]["owner"], "session-1");
        assert_eq!(json[0]["status"], "paused");
        assert_eq!(json[0]["total"], 2);
        assert_eq!(json[0]["profileName"], "main");
    }

    #[tokio::test]
    async fn logs_endpoint_is_event_stream() {
        let app = build_api_router(test_state(), &origins());
        let req = Request::builder()
            .uri("/api/logs")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );
    }

    #[tokio::test]
    async fn cors_allows_only_configured_origins() {
        let app = build_api_router(test_state(), &origins());
        let preflight = |origin: &str| {
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/api/profiles")
                .header(header::ORIGIN, origin)
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                .body(Body::empty())
                .unwrap()
        };

        let allowed = app
            .clone()
            .oneshot(preflight("http://localhost:8080"))
            .await
            .unwrap();
        assert_eq!(
            allowed
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "http://localhost:8080"
        );

        let denied = app.oneshot(preflight("http://evil.example")).await.unwrap();
        assert!(
            denied
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .is_none()
        );
    }

    #[tokio::test]
    async fn ws_route_requires_upgrade() {
        let app = build_api_router(test_state(), &origins());
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn method_not_allowed_returns_405() {
        let app = build_api_router(test_state(), &origins());
        let req = Request::builder()
            .method(Method::DELETE)
            .uri("/api/profiles")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
