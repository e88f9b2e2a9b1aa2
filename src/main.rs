use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use dccbot::config::Config;
use dccbot::dcc::registry::TransferRegistry;
use dccbot::irc::supervisor::Supervisor;
use dccbot::logbuf::{LogBuffer, LogBufferLayer};
use dccbot::web::{build_router, AppState};

#[tokio::main]
async fn main() {
    let logbuf = LogBuffer::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(LogBufferLayer::new(Arc::clone(&logbuf)))
        .init();

    info!("dccbot {}", env!("CARGO_PKG_VERSION"));

    let config = match Config::load("config.json") {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = tokio::fs::create_dir_all(&config.download_path).await {
        error!(
            "cannot create download path {}: {e}",
            config.download_path.display()
        );
        std::process::exit(1);
    }

    let registry = Arc::new(TransferRegistry::new(Duration::from_secs(
        config.transfer_list_timeout,
    )));
    let supervisor = Supervisor::new(Arc::clone(&config), registry);
    supervisor.spawn_reaper();

    let state = AppState {
        supervisor: Arc::clone(&supervisor),
        logbuf,
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            std::process::exit(2);
        }
    };
    info!("control plane listening on http://{addr}");

    let shutdown = supervisor.shutdown_token();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        error!("server error: {e}");
        std::process::exit(2);
    }
    info!("clean shutdown");
}
