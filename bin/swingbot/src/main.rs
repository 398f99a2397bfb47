use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{CandleSource, Config, EngineCommand, Result, RiskEvent};
use engine::{trend_cell, Engine, Pipeline, PipelineFileConfig, ReplaySource, SnapshotStore};
use paper::PaperGateway;

#[tokio::main]
async fn main() {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "swingbot failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env()?;
    let file = PipelineFileConfig::load(&cfg.strategy_config_path)?;
    info!(
        path = %cfg.strategy_config_path,
        pipelines = file.pipelines.len(),
        "swingbot starting"
    );

    // ── Persistence ───────────────────────────────────────────────────────────
    let store = match &cfg.database_url {
        Some(url) => Some(SnapshotStore::connect(url).await?),
        None => {
            info!("DATABASE_URL not set, risk snapshots are not persisted");
            None
        }
    };

    // ── Gateway, engine, shared trend cells ───────────────────────────────────
    let gateway = Arc::new(PaperGateway::new(
        cfg.paper_slippage_bps,
        cfg.paper_reject_every,
    ));
    let (mut engine, handle) = Engine::new();
    let (events_tx, mut events_rx) = mpsc::channel::<RiskEvent>(1024);

    let mut publishers = HashMap::new();
    let mut readers = HashMap::new();
    for p in file.pipelines.iter().filter(|p| p.publish_trend) {
        let (publisher, reader) = trend_cell();
        publishers.insert(p.name.clone(), publisher);
        readers.insert(p.name.clone(), reader);
    }

    let mut source = ReplaySource::new();
    for p in &file.pipelines {
        if let Some(path) = &p.bars_path {
            source.add(&p.instrument, p.timeframe(), path);
        }
    }

    // ── Pipelines ─────────────────────────────────────────────────────────────
    for p in &file.pipelines {
        if p.bars_path.is_none() {
            warn!(pipeline = %p.name, "No bars_path configured, pipeline skipped");
            continue;
        }
        let trading = p.signal.is_some();
        let mut pipeline =
            Pipeline::new(p, gateway.clone(), handle.state_handle(), events_tx.clone())?;
        if let Some(publisher) = publishers.remove(&p.name) {
            pipeline = pipeline.with_publisher(publisher);
        }
        if let Some(reader) = p.higher_timeframe.as_ref().and_then(|h| readers.get(h)) {
            pipeline = pipeline.with_higher_trend(reader.clone());
        }
        if let (true, Some(store)) = (trading, &store) {
            pipeline = pipeline.with_store(store.clone());
            pipeline.restore().await?;
        }

        let bars = source.subscribe(&p.instrument, p.timeframe())?;
        // Only the trading stream drives the paper book and receives fills.
        let (bars, fills) = if trading {
            let fills = gateway.subscribe_fills(&p.instrument).await;
            (paper::tee_bars(gateway.clone(), p.instrument.clone(), bars), fills)
        } else {
            (bars, mpsc::unbounded_channel().1)
        };
        engine.add_pipeline(pipeline, bars, fills);
    }
    drop(events_tx);

    // ── Risk event log ────────────────────────────────────────────────────────
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            log_event(&event);
        }
    });

    // ── Run ───────────────────────────────────────────────────────────────────
    let engine_task = tokio::spawn(engine.run());
    handle.send(EngineCommand::Start).await;

    tokio::select! {
        res = engine_task => {
            if let Err(e) = res {
                error!(error = %e, "Engine task failed");
            }
            info!("All bar streams finished. Exiting.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting.");
        }
    }
    Ok(())
}

fn log_event(event: &RiskEvent) {
    match event {
        RiskEvent::PositionOpened {
            instrument,
            side,
            entry_price,
        } => info!(%instrument, %side, entry_price, "Position opened"),
        RiskEvent::ExitTriggered {
            instrument,
            reason,
            level,
        } => info!(%instrument, %reason, level, "Exit triggered"),
        RiskEvent::StopMoved {
            instrument,
            stop_price,
        } => info!(%instrument, stop_price, "Stop moved"),
        RiskEvent::PositionClosed { instrument } => info!(%instrument, "Position closed"),
        RiskEvent::OrderFailed { instrument, error } => {
            warn!(%instrument, %error, "Order failed")
        }
        RiskEvent::Frozen { instrument, detail } => {
            error!(%instrument, %detail, "Risk management frozen, manual resolution required")
        }
        RiskEvent::DataGap { instrument, detail } => warn!(%instrument, %detail, "Data gap"),
    }
}
