use anyhow::{Context, Result};
use miner_telemetry::config::Config;
use miner_telemetry::device::DeviceClient;
use miner_telemetry::explorer::ExplorerService;
use miner_telemetry::history::HistoryStore;
use miner_telemetry::poller::{self, TelemetryService};
use miner_telemetry::server::{self, AppState};
use miner_telemetry::stream::StreamMultiplexer;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing();

    let store = HistoryStore::new(config.history_dir.clone());
    let telemetry = TelemetryService::from_store(&store, config.max_history);
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;
    let cancel = CancellationToken::new();

    let poll_handle = match &config.miner_host {
        Some(host) => {
            let client = DeviceClient::new(http.clone(), host);
            tracing::info!(miner = %host, interval_ms = config.poll_interval_ms, "telemetry polling enabled");
            Some(poller::spawn_poll_loop(
                telemetry.clone(),
                client,
                store.clone(),
                config.poll_interval(),
                config.persist_min_interval(),
                cancel.clone(),
            ))
        }
        None => {
            tracing::warn!("MINER_HOST is not set; telemetry polling disabled");
            telemetry.record_error("no miner host configured");
            None
        }
    };

    let stream = StreamMultiplexer::new(config.miner_ws_url());

    let explorer = config.explorer_api_base.clone().map(|base| {
        let service = ExplorerService::new(http.clone(), base, config.explorer_poll_interval());
        service.start(cancel.clone());
        service
    });

    let state = AppState {
        telemetry,
        stream,
        explorer,
    };
    let app = server::router(state);
    let addr = format!("{}:{}", config.listen_host, config.listen_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind listener on {addr}"))?;
    tracing::info!(%addr, "listening");

    let serve_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::select! {
        result = serve_handle => {
            match result {
                Ok(Err(err)) => tracing::error!(error = %err, "server exited"),
                Err(err) => tracing::error!(error = %err, "server task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    // The poll loop does a final unconditional history save on its way out.
    if let Some(handle) = poll_handle {
        let _ = handle.await;
    }
    Ok(())
}
