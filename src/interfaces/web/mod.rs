mod handlers;
mod router;
mod session;

pub use router::build_api_router;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::core::jobs::BulkController;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::profiles::ProfileStore;

/// Longest wait for ended jobs to report before the listener stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) profiles: ProfileStore,
    pub(crate) controller: BulkController,
    pub(crate) log_tx: broadcast::Sender<String>,
}

pub struct ApiServerConfig {
    pub profiles: ProfileStore,
    pub controller: BulkController,
    pub log_tx: broadcast::Sender<String>,
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

pub struct ApiServer {
    state: AppState,
    host: String,
    port: u16,
    allowed_origins: Vec<String>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            state: AppState {
                profiles: config.profiles,
                controller: config.controller,
                log_tx: config.log_tx,
            },
            host: config.host,
            port: config.port,
            allowed_origins: config.allowed_origins,
            local_addr: None,
            shutdown_tx: None,
        }
    }

    /// Address actually bound; set once `on_start` succeeds.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(line) => Ok(Event::default().data(line)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// --- Lifecycle ---

#[async_trait]
impl LifecycleComponent for ApiServer {
    fn name(&self) -> &'static str {
        "API server"
    }

    async fn on_init(&mut self) -> Result<()> {
        info!(
            "API server initializing with {} profile(s)",
            self.state.profiles.len()
        );
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Could not bind API server to {}", addr))?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let app = router::build_api_router(self.state.clone(), &self.allowed_origins);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        tokio::spawn(async move {
            info!("API server running at http://{}", local_addr);
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!("API server crashed: {}", e);
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        let controller = &self.state.controller;
        for job in controller.registry().list().await {
            controller.end_job(&job.job_id).await;
        }
        if !controller.wait_until_idle(SHUTDOWN_GRACE).await {
            warn!("Some jobs did not finish within {:?}", SHUTDOWN_GRACE);
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        info!("API server shutting down");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    use crate::core::jobs::{JobRegistry, JobTiming};
    use crate::core::profiles::test_profile;
    use std::sync::Arc;
    use std::time::Duration;

    let timing = JobTiming {
        pause_poll: Duration::from_millis(5),
        sleep_tick: Duration::from_millis(5),
        verify_delay: Duration::from_millis(10),
    };
    let (log_tx, _) = broadcast::channel(16);
    AppState {
        profiles: ProfileStore::new(vec![test_profile("main")]).expect("profiles"),
        controller: BulkController::new(
            JobRegistry::new(),
            Arc::new(crate::test_support::StaticDesk),
            timing,
        ),
        log_tx,
    }
}
