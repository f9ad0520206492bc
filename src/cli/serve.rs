use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use super::ServeFlags;
use crate::core::config::RelayConfig;
use crate::core::desk::DeskGateway;
use crate::core::jobs::{BulkController, JobRegistry, JobTiming};
use crate::core::lifecycle::{LifecycleManager, SharedComponent};
use crate::core::oauth::TokenCache;
use crate::core::profiles::ProfileStore;
use crate::core::terminal::{self, GuideSection};
use crate::interfaces::web::{ApiServer, ApiServerConfig};
use crate::logging::SseMakeWriter;

/// Wires the desk gateway, shared token cache and job registry together.
pub(crate) fn build_controller(config: &RelayConfig) -> Result<BulkController> {
    let client = DeskGateway::build_client(&config.desk)?;
    let tokens = Arc::new(TokenCache::new(
        client.clone(),
        config.desk.accounts_url.clone(),
    ));
    let gateway = Arc::new(DeskGateway::new(client, tokens, &config.desk));
    Ok(BulkController::new(
        JobRegistry::new(),
        gateway,
        JobTiming::from(&config.jobs),
    ))
}

pub async fn run_server(flags: ServeFlags) -> Result<()> {
    let make_writer = SseMakeWriter::new(false);
    let log_tx = make_writer.sender.clone();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let config = flags.load_config().await?;
    let profiles = ProfileStore::load(&config.server.profiles_path).await?;
    if profiles.is_empty() {
        warn!(
            "{} contains no profiles; every command will fail until one is added.",
            config.server.profiles_path.display()
        );
    }
    info!(
        "Loaded {} profile(s) from {}",
        profiles.len(),
        config.server.profiles_path.display()
    );

    let controller = build_controller(&config)?;
    let server = Arc::new(Mutex::new(ApiServer::new(ApiServerConfig {
        profiles,
        controller,
        log_tx,
        host: config.server.host.clone(),
        port: config.server.port,
        allowed_origins: config.server.allowed_origins.clone(),
    })));

    let mut lifecycle = LifecycleManager::new();
    let component: SharedComponent = server.clone();
    lifecycle.attach(component);
    lifecycle.start().await?;

    if let Some(addr) = server.lock().await.local_addr() {
        terminal::print_banner();
        GuideSection::new("Relay")
            .status("API", &format!("http://{}/api", addr))
            .status("Sessions", &format!("ws://{}/ws", addr))
            .status("Logs", &format!("http://{}/api/logs", addr))
            .blank()
            .text("Press Ctrl+C to stop.")
            .print();
        println!();
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down relay...");
    lifecycle.shutdown().await?;

    // Give session loops a moment to flush the final job events.
    tokio::time::sleep(config.jobs.sleep_tick()).await;
    terminal::print_goodbye();
    Ok(())
}
