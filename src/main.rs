use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use mirrorbot::clock::{Clock, SystemClock};
use mirrorbot::config::{AppConfig, RunMode};
use mirrorbot::db;
use mirrorbot::decision::DecisionService;
use mirrorbot::execution::OrderExecutor;
use mirrorbot::ingestion::coordinator::IngestCoordinator;
use mirrorbot::ingestion::hyperliquid::{self, HyperliquidClient};
use mirrorbot::metrics;
use mirrorbot::orchestrator::Orchestrator;
use mirrorbot::safety::SafetyMonitor;
use mirrorbot::venue::binance::BinanceVenue;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls CryptoProvider");

    dotenvy::dotenv().ok();
    init_tracing();

    let mode = parse_mode()?;
    let config = AppConfig::from_env()?;
    config.validate(mode)?;

    let _metrics_handle = metrics::init_metrics();
    tracing::info!("Prometheus metrics initialized");

    tracing::info!(path = %config.db_path, "Opening local store...");
    let pool = db::init_pool(&config.db_path).await?;
    tracing::info!("Local store ready");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let boot_ms = clock.now_ms();

    // --- Shutdown signal, propagated to every task ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl+c");
            return;
        }
        tracing::info!("Received SIGINT, starting graceful shutdown...");
        let _ = shutdown_tx.send(true);
    });

    // --- Leader source: REST client + fill stream ---
    let leader = Arc::new(HyperliquidClient::new(config.hyperliquid_config())?);
    let stream_rx = if mode != RunMode::BackfillOnly && !config.leader_wallet.is_empty() {
        let (fill_tx, fill_rx) = mpsc::channel(1_000);
        let ws_url = config.leader_ws_url.clone();
        let wallet = config.leader_wallet.clone();
        let max_delay = std::time::Duration::from_secs(config.ws_max_reconnect_delay_sec);
        let stream_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            hyperliquid::run_fill_stream(ws_url, wallet, max_delay, fill_tx, stream_shutdown).await;
        });
        tracing::info!("Leader fill stream spawned");
        Some(fill_rx)
    } else {
        tracing::info!("Leader fill stream disabled for this mode");
        None
    };

    let coordinator = IngestCoordinator::new(leader, stream_rx, config.ingest_config(), boot_ms);

    // --- Execution venue ---
    let venue = Arc::new(BinanceVenue::new(config.binance_config())?);
    let executor = OrderExecutor::new(
        Arc::clone(&venue),
        config.execution_config(mode),
        Arc::clone(&clock),
    );
    let monitor = SafetyMonitor::new(
        Arc::clone(&venue),
        config.safety_config(),
        config.venue_symbols(),
        Arc::clone(&clock),
    );
    let decision = DecisionService::new(config.decision_config());

    if mode == RunMode::Live {
        tracing::info!("Running in LIVE mode");
    } else {
        tracing::info!(mode = %mode, "Venue order writes suppressed");
    }

    let orchestrator = Orchestrator::new(
        pool,
        coordinator,
        decision,
        executor,
        monitor,
        venue,
        config,
        mode,
        clock,
    );
    orchestrator.run(shutdown_rx).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn parse_mode() -> anyhow::Result<RunMode> {
    let raw = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RUN_MODE").ok())
        .unwrap_or_else(|| "dry-run".to_string());
    RunMode::parse(&raw)
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();
}
