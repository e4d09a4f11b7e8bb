use anyhow::Context;
use clap::Parser;
use neuroscope_relay::{
    build_router,
    cli::{format_topic_table, Cli, Commands},
    BatchingRelay, BroadcastManager, RelayConfig, RelayState, WsBroker,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "neuroscope_relay=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let mut config = RelayConfig::from_env().context("invalid relay configuration")?;
    if let Some(command) = &cli.command {
        command.apply_overrides(&mut config);
    }

    match cli.command {
        Some(Commands::Topics) => {
            print!("{}", format_topic_table(&config));
            Ok(())
        }
        Some(Commands::Serve { .. }) | None => serve(config).await,
    }
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    info!("🚀 Starting Neuroscope Relay v{}", VERSION);
    info!("📋 Configuration loaded:");
    info!("   Broker: {}", config.broker_url);
    info!("   Flush interval: {:?}", config.flush_interval);
    info!("   Backpressure threshold: {} bytes", config.backpressure_threshold);
    info!("   Heartbeat interval: {:?}", config.heartbeat_interval);
    info!("   Routes: {}", config.routes.len());

    // Create broadcast manager
    let manager = BroadcastManager::from_routes(&config.routes, config.backpressure_threshold);

    // Start the relay
    let mut relay = BatchingRelay::new(&config.routes, manager.clone(), config.flush_interval)
        .with_backoff(config.broker_backoff);
    let metrics = relay.metrics();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut broker = WsBroker::new(config.broker_url.clone());
    let relay_task = tokio::spawn(async move { relay.run(&mut broker, shutdown_rx).await });

    // Spawn background task to report skipped frames
    {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(60));
            let mut last_dropped = 0u64;
            loop {
                interval.tick().await;
                let dropped: u64 = manager.snapshot().iter().map(|t| t.dropped_frames).sum();
                if dropped != last_dropped {
                    warn!(
                        "Backpressure skipped {} frames in the last minute ({} total, {} clients)",
                        dropped - last_dropped,
                        dropped,
                        manager.total_clients()
                    );
                    last_dropped = dropped;
                }
            }
        });
    }

    let state = RelayState::new(
        manager.clone(),
        metrics,
        config.upstreams.clone(),
        config.heartbeat_interval,
    );
    let app = build_router(state, &config.cors_origins);

    // Start server
    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_address()))?;
    info!("🎧 Listening on http://{}", addr);
    info!("📡 WebSocket endpoint: ws://{}/ws/{{topic}}", addr);
    info!("🔑 Health endpoint: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutting down");
            let _ = shutdown_tx.send(true);
            manager.shutdown();
        })
        .await?;

    match relay_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Relay stopped with error: {}", e),
        Err(e) => error!("Relay task panicked: {}", e),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
