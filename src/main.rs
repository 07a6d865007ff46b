//! Bonding-curve launchpad scanner
//!
//! Wires the full pipeline: stream ingestion → category manager → scan
//! scheduler → buy-signal evaluator, with metadata enrichment and metrics
//! on the side. Shutdown is ordered: stream first, one final flush, then
//! the scheduler, then the category manager, under a 30-second hard cap.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use curvescan::analytics::StoredAnalytics;
use curvescan::buy_engine::BuySignalEngine;
use curvescan::category::CategoryManager;
use curvescan::config::{ConfigHandle, Settings};
use curvescan::enrichment::{Enricher, HttpMetadataProvider};
use curvescan::errors::EngineError;
use curvescan::events::EventBus;
use curvescan::ingest::batcher::IngestBuffers;
use curvescan::ingest::{create_stream_source, StreamManager};
use curvescan::metrics;
use curvescan::scheduler::handler::{CategoryScanHandler, HttpMarketDataProvider};
use curvescan::scheduler::ScanScheduler;
use curvescan::storage::Store;
use curvescan::types::Category;
use curvescan::{curve, endpoints};

/// Exit code for fatal startup failures (config validation, schema check)
const EXIT_STARTUP: i32 = 1;
/// Exit code for unrecoverable storage failures
const EXIT_STORAGE: i32 = 2;
/// Hard cap on the shutdown sequence
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about = "Bonding-curve launchpad scanner", long_about = None)]
struct Args {
    /// Stream source mode (mock, or a registered geyser adapter)
    #[arg(long, env = "STREAM_MODE", default_value = "mock")]
    stream_mode: String,

    /// Market-data provider base URL
    #[arg(long, env = "MARKET_DATA_API_URL", default_value = "https://api.dexscreener.com/tokens")]
    market_data_url: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "curvescan=debug,info"
    } else {
        "curvescan=info,warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(args.verbose);

    info!("starting curvescan {}", env!("CARGO_PKG_VERSION"));

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            std::process::exit(EXIT_STARTUP);
        }
    };
    let config = ConfigHandle::new(settings.clone());
    config.on_reload(|fresh| {
        info!(
            low_max = fresh.thresholds.low_max,
            aim_max = fresh.thresholds.aim_max,
            "settings snapshot swapped"
        );
    });

    let store = match Store::open(&settings.storage.path, settings.storage.pool_max) {
        Ok(store) => store,
        Err(EngineError::Config(msg)) => {
            error!(error = %msg, "schema check failed");
            std::process::exit(EXIT_STARTUP);
        }
        Err(e) => {
            error!(error = %e, "storage unavailable");
            std::process::exit(EXIT_STORAGE);
        }
    };

    curve::set_sol_price_usd(settings.sol_price_usd);

    if let Err(e) = run(args, config, store).await {
        error!(error = %e, "fatal runtime error");
        std::process::exit(EXIT_STORAGE);
    }
    info!("shutdown complete");
}

async fn run(args: Args, config: Arc<ConfigHandle>, store: Arc<Store>) -> Result<()> {
    let settings = config.load();
    let events = EventBus::default();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // metrics endpoint
    let metrics_port = settings.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = endpoints::endpoint_server(metrics_port).await {
            error!(error = %e, "metrics endpoint failed");
        }
    });

    // category manager and startup rehydrate
    let manager = CategoryManager::new(config.clone(), store.clone(), events.clone());
    manager.rehydrate().await;
    metrics::metrics()
        .active_machines
        .set(manager.active_count() as i64);

    // analytics and buy engine
    let analytics = StoredAnalytics::new(
        store.clone(),
        Duration::from_secs(settings.scans.aim.interval_secs),
    );
    let buy_engine = BuySignalEngine::new(
        config.clone(),
        store.clone(),
        analytics,
        events.clone(),
    );

    // metadata enrichment pool
    let metadata_provider = Arc::new(HttpMetadataProvider::new(&settings.enrichment)?);
    let enricher = Enricher::new(
        store.clone(),
        events.clone(),
        metadata_provider,
        settings.enrichment.clone(),
    );
    let (enrich_tx, enrich_handles) = enricher.spawn(shutdown_rx.clone());

    // on-demand evaluation queue fed by the stream's AIM-band check
    let (eval_tx, mut eval_rx) = mpsc::channel::<String>(1_024);
    {
        let buy_engine = buy_engine.clone();
        let mut eval_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    job = eval_rx.recv() => match job {
                        Some(address) => {
                            let engine = buy_engine.clone();
                            let evaluation = tokio::time::timeout(
                                Duration::from_secs(10),
                                tokio::task::spawn_blocking(move || engine.evaluate(&address)),
                            )
                            .await;
                            match evaluation {
                                Ok(Ok(Ok(_))) => {}
                                Ok(Ok(Err(e))) => tracing::debug!(error = %e, "evaluation refused"),
                                Ok(Err(e)) => warn!(error = %e, "evaluation task panicked"),
                                Err(_) => warn!("evaluation timed out"),
                            }
                        }
                        None => break,
                    },
                    _ = eval_shutdown.changed() => break,
                }
            }
        });
    }

    // scan scheduler with the shared category handler
    let scheduler = ScanScheduler::new(
        config.clone(),
        store.clone(),
        manager.clone(),
        events.clone(),
    );
    let market_provider = Arc::new(HttpMarketDataProvider::new(
        &args.market_data_url,
        Duration::from_secs(15),
    )?);
    let scan_handler = CategoryScanHandler::new(
        config.clone(),
        store.clone(),
        market_provider,
        buy_engine.clone(),
    );
    for category in Category::ACTIVE {
        scheduler.register_handler(category, scan_handler.clone());
    }
    let scheduler_handles = scheduler.start();

    // seed scan queues with the rehydrated population
    let mut offset = 0usize;
    loop {
        let page = store.load_active_tokens(7, 1_000, offset)?;
        if page.is_empty() {
            break;
        }
        for row in &page {
            scheduler.schedule(&row.address, row.category, row.category_scan_count);
        }
        offset += page.len();
    }

    // stream ingestion
    let buffers = Arc::new(IngestBuffers::new(settings.ingest.batch_size));
    let stream = StreamManager::new(
        config.clone(),
        store.clone(),
        manager.clone(),
        events.clone(),
        buffers,
        enrich_tx,
        eval_tx,
    );
    stream.seed_sol_price();
    let flush_handle = stream.spawn_flush_ticker(shutdown_rx.clone());
    let source = create_stream_source(&args.stream_mode, &settings.ingest.grpc_endpoint)?;
    let stream_handle = {
        let stream = stream.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            stream.run(source, shutdown_rx).await;
        })
    };

    // periodic SOL price refresh from history, plus config reload on SIGHUP
    {
        let store = store.clone();
        let refresh = Duration::from_millis(settings.ingest.price_refresh_interval_ms);
        let mut refresh_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Ok(Some(price)) = store.latest_sol_price() {
                            curve::set_sol_price_usd(price);
                        }
                    }
                    _ = refresh_shutdown.changed() => break,
                }
            }
        });
    }
    {
        let config = config.clone();
        tokio::spawn(async move {
            let Ok(mut hup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hup.recv().await.is_some() {
                if let Err(e) = config.reload() {
                    warn!(error = %e, "reload rejected, keeping current settings");
                }
            }
        });
    }

    // main loop: periodic stats until a termination signal arrives
    let mut stats_interval = tokio::time::interval(Duration::from_secs(60));
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = stats_interval.tick() => {
                metrics::metrics().active_machines.set(manager.active_count() as i64);
                let depth: usize = Category::ACTIVE
                    .iter()
                    .map(|c| scheduler.queue_depth(*c))
                    .sum();
                info!(
                    machines = manager.active_count(),
                    queued_scans = depth,
                    flush_error_rate = metrics::metrics().flush_error_rate(),
                    "heartbeat"
                );
                if metrics::metrics().flush_saturated() {
                    warn!("flush error rate above 10% over the last 5 minutes");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }
        }
    }

    // ordered shutdown under the hard deadline
    let shutdown = async {
        // 1. stop the stream reader
        let _ = shutdown_tx.send(true);
        let _ = stream_handle.await;

        // 2. flush whatever is still buffered
        stream.final_flush();
        flush_handle.abort();

        // 3. stop the scheduler; in-flight scans get a grace period
        scheduler.stop();
        for handle in scheduler_handles {
            handle.abort();
        }

        // 4. stop the category manager
        manager.shutdown();

        // 5. enrichment workers drain on the shutdown signal
        for handle in enrich_handles {
            handle.abort();
        }
    };

    if tokio::time::timeout(SHUTDOWN_DEADLINE, shutdown).await.is_err() {
        warn!("shutdown deadline exceeded, forcing exit");
    }

    Ok(())
}
