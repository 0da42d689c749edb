//! RevWatch server binary
//!
//! Boots the storage layer, worker pools, scheduler, and HTTP listener.
//! Exits non-zero on missing required configuration; drains the queues on
//! SIGTERM/ctrl-c before exiting.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use revwatch_gateway::{build_router, scheduler, AppState};
use revwatch_shared::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("starting RevWatch v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env()?;
    let server = config.server.clone();

    let bootstrap = AppState::initialize(config).await?;
    let state = bootstrap.state.clone();
    info!("application state initialized");

    let scheduler_handles = scheduler::start(
        state.clone(),
        scheduler::SchedulerConfig::default(),
        bootstrap.shutdown.subscribe(),
    );

    let app = build_router(state.clone());
    let addr: SocketAddr = format!("{}:{}", server.host, server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", addr);
    info!("webhook ingress: http://{}/webhooks/{{org_slug}}/{{source}}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain: stop intake, let workers finish in-flight jobs
    info!("draining worker pools");
    let _ = bootstrap.shutdown.send(true);
    state.queue.close();
    for handle in scheduler_handles {
        handle.abort();
    }
    for handle in bootstrap.worker_handles {
        if tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .is_err()
        {
            warn!("worker did not drain within 30s");
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "revwatch=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl-c, shutting down");
        },
        _ = terminate => {
            warn!("received SIGTERM, shutting down");
        },
    }
}
