use std::sync::Arc;

use anyhow::{Context, Result};
use axum::serve;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use wa_core::{BridgeClientFactory, BridgeConfig};
use wa_dispatch::{DispatchConfig, SendOrchestrator};
use wa_session::{SessionConfig, SessionController};

use crate::config::GatewayConfig;
use crate::http::{AppState, build_router};
use crate::uploads::UploadStore;

/// Starts the session controller and serves the HTTP API until a shutdown signal arrives.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let factory = BridgeClientFactory::new(BridgeConfig::new(config.bridge_url.clone()));
    let session = SessionController::new(
        SessionConfig::with_identity(config.identity.clone()),
        Arc::new(factory),
    );
    let orchestrator = Arc::new(SendOrchestrator::new(
        session.clone(),
        DispatchConfig::default(),
    ));

    let uploads = UploadStore::new(config.upload_dir.clone());
    uploads
        .ensure_dir()
        .await
        .with_context(|| format!("creating upload dir {}", config.upload_dir.display()))?;

    let router = build_router(AppState::new(orchestrator, uploads), &config.cors);
    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    info!(
        addr = %config.addr,
        bridge = %config.bridge_url,
        client_id = %config.identity.client_id,
        "wa-gateway listening"
    );

    if let Some(delay) = config.auto_init_delay {
        let session = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("starting whatsapp session");
            if let Err(err) = session.initialize().await {
                warn!(error = %err, "automatic session start failed");
            }
        });
    }

    serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("http server stopped, closing session");
    session.shutdown(config.shutdown_grace).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
