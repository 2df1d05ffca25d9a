use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pipeline::{
    config::AppConfig,
    db::Db,
    ingest::{FeedIngestor, IngestorConfig},
    logger::{TraceId, annotate_span, init_tracing, root_span},
    market::binance::{BinancePriceClient, BinanceTradeSource},
    metrics::Counters,
    pairs::{PairControl, PairPoller, PairPollerConfig, PairSession},
    queue::{DurableQueue, MemoryQueue, SqlxQueue},
    state::{HotStateStore, MemoryHotStateStore, SqlxHotStateStore},
    worker::{AnalyticsWorker, WorkerConfig},
};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, warn};

/// Grace period for the pair poller to export after a stop request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Builds the queue and hot-state store for the configured endpoint.
async fn init_stores(
    cfg: &AppConfig,
) -> anyhow::Result<(Arc<dyn DurableQueue>, Arc<dyn HotStateStore>)> {
    if cfg.is_in_memory() {
        if cfg.role != pipeline::config::Role::All {
            warn!(role = ?cfg.role, "in-memory stores are not shared across processes");
        }
        return Ok((
            Arc::new(MemoryQueue::new(&cfg.stream_key, cfg.stream_maxlen)),
            Arc::new(MemoryHotStateStore::new()),
        ));
    }

    let db = Db::connect(&cfg.database_url)
        .await
        .context("connect database")?;
    db.migrate().await.context("migrate schema")?;

    Ok((
        Arc::new(SqlxQueue::with_maxlen(
            db.pool.clone(),
            &cfg.stream_key,
            cfg.stream_maxlen,
        )),
        Arc::new(SqlxHotStateStore::new(db.pool.clone())),
    ))
}

fn start_ingestor(
    cfg: &AppConfig,
    queue: Arc<dyn DurableQueue>,
    counters: Counters,
    trace_id: &TraceId,
) -> JoinHandle<()> {
    let ingestor = FeedIngestor::new(
        BinanceTradeSource::new(cfg.feed_url.clone()),
        queue,
        IngestorConfig {
            reconnect_min: cfg.reconnect_min,
            reconnect_max: cfg.reconnect_max,
            idle_timeout: cfg.feed_idle_timeout,
        },
        counters,
    );

    let span = root_span("ingest", trace_id);
    let symbol = cfg.symbol.clone();
    tokio::spawn(
        async move {
            annotate_span(&symbol, None);
            ingestor.run().await;
        }
        .instrument(span),
    )
}

fn start_worker(
    cfg: &AppConfig,
    queue: Arc<dyn DurableQueue>,
    store: Arc<dyn HotStateStore>,
    counters: Counters,
    trace_id: &TraceId,
) -> JoinHandle<()> {
    let worker = AnalyticsWorker::new(
        queue,
        store,
        WorkerConfig {
            group: cfg.consumer_group.clone(),
            consumer: cfg.consumer_name.clone(),
            batch: cfg.worker_batch,
            block: cfg.worker_block,
            claim_idle: cfg.worker_claim_idle,
        },
        counters,
    );

    let span = root_span("analytics", trace_id);
    let symbol = cfg.symbol.clone();
    let consumer = cfg.consumer_name.clone();
    tokio::spawn(
        async move {
            annotate_span(&symbol, Some(&consumer));
            worker.run().await;
        }
        .instrument(span),
    )
}

fn start_pair_poller(
    cfg: &AppConfig,
    store: Arc<dyn HotStateStore>,
    counters: Counters,
    trace_id: &TraceId,
) -> anyhow::Result<(PairControl, JoinHandle<()>)> {
    let source =
        BinancePriceClient::new(cfg.price_rest_url.clone()).context("build price client")?;
    let session = PairSession::new(&cfg.pair_y, &cfg.pair_x, cfg.pair_window, cfg.pair_resample)
        .context("pair session")?;

    let (poller, control) = PairPoller::new(
        source,
        store,
        session,
        PairPollerConfig {
            poll_every: cfg.pair_poll_every,
            z_threshold: cfg.pair_z_threshold,
            export_dir: cfg.pair_export_dir.clone(),
        },
        counters,
    );

    let span = root_span("pairs", trace_id);
    let pair = format!("{}-{}", cfg.pair_y, cfg.pair_x);
    let handle = tokio::spawn(
        async move {
            annotate_span(&pair, None);
            poller.run().await;
        }
        .instrument(span),
    );

    Ok((control, handle))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    let cfg = match AppConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return Err(e).context("invalid configuration");
        }
    };

    let trace_id = TraceId::generate();
    info!(
        role = ?cfg.role,
        symbol = %cfg.symbol,
        trace_id = %trace_id.as_str(),
        "starting tick pipeline"
    );

    let (queue, store) = init_stores(&cfg).await?;
    let counters = Counters::default();

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if cfg.role.runs_ingest() {
        tasks.push(start_ingestor(&cfg, queue.clone(), counters.clone(), &trace_id));
    }

    if cfg.role.runs_analytics() {
        tasks.push(start_worker(
            &cfg,
            queue.clone(),
            store.clone(),
            counters.clone(),
            &trace_id,
        ));
    }

    let pairs = if cfg.role.runs_pairs() {
        Some(start_pair_poller(&cfg, store.clone(), counters.clone(), &trace_id)?)
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    if let Some((control, handle)) = pairs {
        // Stopping a live poller pauses it first, which writes the export.
        info!(live = control.is_live(), "stopping pair poller");
        control.stop();
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("pair poller did not stop in time");
        }
    }

    for t in &tasks {
        t.abort();
    }

    counters.log_totals();
    Ok(())
}
