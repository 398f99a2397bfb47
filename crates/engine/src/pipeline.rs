use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, trace, warn};

use common::{
    Bar, EngineState, Error, Fill, OrderGateway, OrderId, Position, PivotUpdate, RejectedLeg,
    Result, RiskAction, RiskEvent, TrendDirection, TrendState,
};
use risk::{FillOutcome, PositionRiskManager, RiskSnapshot};
use strategy::indicators::Atr;
use strategy::{build_evaluator, BarCheck, PivotDetector, SignalContext, SignalEvaluator, TrendStateTracker};

use crate::cell::{TrendPublisher, TrendReader};
use crate::config::PipelineConfig;
use crate::protection::{ProtectiveSlot, StopReplace};
use crate::store::SnapshotStore;

/// One (instrument, timeframe) stream: pivots → trend → signal → risk → orders.
///
/// Every bar and every fill is handled to completion on the pipeline's own
/// task before the next one is looked at.
pub struct Pipeline {
    name: String,
    instrument: String,
    detector: PivotDetector,
    tracker: TrendStateTracker,
    atr: Atr,
    evaluator: Option<Box<dyn SignalEvaluator>>,
    risk: PositionRiskManager,
    slot: ProtectiveSlot,
    gateway: Arc<dyn OrderGateway>,
    publisher: Option<TrendPublisher>,
    higher: Option<TrendReader>,
    engine_state: Arc<RwLock<EngineState>>,
    store: Option<SnapshotStore>,
    events: mpsc::Sender<RiskEvent>,
    pending_entry: Option<OrderId>,
    pending_exit: Option<OrderId>,
    last_bar_time: Option<DateTime<Utc>>,
    last_saved: Option<RiskSnapshot>,
}

impl Pipeline {
    pub fn new(
        cfg: &PipelineConfig,
        gateway: Arc<dyn OrderGateway>,
        engine_state: Arc<RwLock<EngineState>>,
        events: mpsc::Sender<RiskEvent>,
    ) -> Result<Self> {
        let mut detector = PivotDetector::new(cfg.instrument.clone(), cfg.pivot.clone())?;
        if let Some(max) = cfg.max_interval() {
            detector = detector.with_max_interval(max);
        }
        let evaluator = cfg
            .signal
            .as_ref()
            .map(|s| build_evaluator(s, cfg.volume))
            .transpose()?;
        info!(
            pipeline = %cfg.name,
            instrument = %cfg.instrument,
            timeframe_secs = cfg.timeframe_secs,
            signal = ?evaluator.as_ref().map(|e| e.name().to_string()),
            "Pipeline built"
        );
        Ok(Self {
            name: cfg.name.clone(),
            instrument: cfg.instrument.clone(),
            detector,
            tracker: TrendStateTracker::new(),
            atr: Atr::new(cfg.atr.period)?,
            evaluator,
            risk: PositionRiskManager::new(cfg.instrument.clone(), cfg.risk.clone())?,
            slot: ProtectiveSlot::new(cfg.instrument.clone(), gateway.clone()),
            gateway,
            publisher: None,
            higher: None,
            engine_state,
            store: None,
            events,
            pending_entry: None,
            pending_exit: None,
            last_bar_time: None,
            last_saved: None,
        })
    }

    /// Replace the configured entry rule.
    pub fn with_evaluator(mut self, evaluator: Box<dyn SignalEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Publish this stream's trend after every pivot change.
    pub fn with_publisher(mut self, publisher: TrendPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Read a higher-timeframe trend when evaluating entries.
    pub fn with_higher_trend(mut self, reader: TrendReader) -> Self {
        self.higher = Some(reader);
        self
    }

    pub fn with_store(mut self, store: SnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn detector(&self) -> &PivotDetector {
        &self.detector
    }

    pub fn trend(&self) -> &TrendState {
        self.tracker.state()
    }

    pub fn risk(&self) -> &PositionRiskManager {
        &self.risk
    }

    pub fn slot(&self) -> &ProtectiveSlot {
        &self.slot
    }

    /// Load the last persisted risk state, if any. Protection is re-placed on
    /// the next bar.
    pub async fn restore(&mut self) -> Result<()> {
        let Some(store) = &self.store else { return Ok(()) };
        let Some(snapshot) = store.load(&self.instrument).await? else {
            return Ok(());
        };
        self.risk = PositionRiskManager::restore(self.risk.config().clone(), &snapshot)?;
        self.last_saved = Some(snapshot);
        Ok(())
    }

    /// Drive the pipeline until the bar stream ends. Fills are preferred over
    /// bars so a position change is always seen before the next bar.
    pub async fn run(
        mut self,
        mut bars: mpsc::Receiver<Bar>,
        mut fills: mpsc::UnboundedReceiver<Fill>,
    ) {
        info!(pipeline = %self.name, "Pipeline running");
        loop {
            tokio::select! {
                biased;
                Some(fill) = fills.recv() => {
                    if let Err(e) = self.on_fill(fill).await {
                        error!(pipeline = %self.name, error = %e, "Fill handling failed");
                    }
                }
                bar = bars.recv() => match bar {
                    Some(bar) => {
                        if let Err(e) = self.on_bar(&bar).await {
                            error!(pipeline = %self.name, error = %e, "Bar handling failed");
                        }
                    }
                    None => break,
                },
            }
        }
        while let Ok(fill) = fills.try_recv() {
            if let Err(e) = self.on_fill(fill).await {
                error!(pipeline = %self.name, error = %e, "Fill handling failed");
            }
        }
        info!(
            pipeline = %self.name,
            bars = self.detector.bars_seen(),
            risk_state = %self.risk.state(),
            "Bar stream ended, pipeline stopped"
        );
    }

    /// Process one bar to completion.
    pub async fn on_bar(&mut self, bar: &Bar) -> Result<()> {
        if !bar.is_final {
            trace!(pipeline = %self.name, time = %bar.open_time, "Partial bar skipped");
            return Ok(());
        }
        match self.detector.check(bar) {
            Ok(BarCheck::Fresh) => {}
            Ok(BarCheck::Replay) => {
                debug!(pipeline = %self.name, time = %bar.open_time, "Replayed bar ignored");
                return Ok(());
            }
            Err(Error::DataGap { instrument, detail }) => {
                warn!(pipeline = %self.name, detail = %detail, "Data gap");
                self.emit(RiskEvent::DataGap { instrument, detail }).await;
                let stale = self.last_bar_time.is_some_and(|t| bar.open_time <= t);
                if stale || !(bar.high >= bar.low) {
                    return Ok(());
                }
                self.detector.resync();
            }
            Err(e) => return Err(e),
        }
        self.last_bar_time = Some(bar.open_time);

        let previous_direction = self.tracker.direction();
        let update = self.detector.on_bar(bar)?;
        if let Some(update) = &update {
            self.on_pivot_update(update, previous_direction);
        }

        self.risk.update_atr(self.atr.update(bar));
        let action = self.risk.on_bar(bar)?;
        self.act(action).await;

        self.maybe_enter(bar, update.as_ref(), previous_direction).await;
        self.persist().await;
        Ok(())
    }

    /// Reconcile one execution report.
    pub async fn on_fill(&mut self, fill: Fill) -> Result<()> {
        let leg = self.slot.settle(&fill.order_id);
        if self.pending_entry.as_ref() == Some(&fill.order_id) {
            self.pending_entry = None;
        }
        if self.pending_exit.as_ref() == Some(&fill.order_id) {
            self.pending_exit = None;
        }
        debug!(
            pipeline = %self.name,
            order_id = %fill.order_id,
            side = %fill.side,
            price = fill.price,
            volume = fill.volume,
            protective = leg,
            "Fill received"
        );

        match self.risk.on_fill(&fill) {
            Ok(FillOutcome::Opened(levels)) => {
                if let Some(pos) = self.risk.position().cloned() {
                    self.emit(RiskEvent::PositionOpened {
                        instrument: self.instrument.clone(),
                        side: pos.side,
                        entry_price: pos.entry_price,
                    })
                    .await;
                    if let Err(e) = self.slot.sync(pos.side, pos.volume, &levels).await {
                        self.protection_failed(e).await;
                    }
                }
            }
            Ok(FillOutcome::Reduced(levels)) => {
                let already_filled = match self.slot.cancel_all().await {
                    Ok(filled) => filled,
                    Err(e) => {
                        self.protection_failed(e).await;
                        false
                    }
                };
                // A leg that executed meanwhile closes the rest with its own fill.
                if let (false, Some(pos)) = (already_filled, self.risk.position().cloned()) {
                    if let Err(e) = self.slot.sync(pos.side, pos.volume, &levels).await {
                        self.protection_failed(e).await;
                    }
                }
            }
            Ok(FillOutcome::Closed) => {
                if let Err(e) = self.slot.cancel_all().await {
                    warn!(pipeline = %self.name, error = %e, "Could not cancel bracket after close");
                }
                self.pending_exit = None;
                self.emit(RiskEvent::PositionClosed {
                    instrument: self.instrument.clone(),
                })
                .await;
            }
            Ok(FillOutcome::Duplicate) => {}
            Err(Error::ReconciliationMismatch { instrument, detail }) => {
                self.emit(RiskEvent::Frozen { instrument, detail }).await;
            }
            Err(e) => return Err(e),
        }
        self.persist().await;
        Ok(())
    }

    /// Host decision after a reconciliation mismatch: the true position (or
    /// flat). Live protective orders are cancelled and re-placed on the next
    /// bar.
    pub async fn resolve(&mut self, position: Option<Position>) -> Result<()> {
        self.slot.cancel_all().await?;
        self.pending_exit = None;
        self.risk.resolve(position);
        self.persist().await;
        Ok(())
    }

    fn on_pivot_update(&mut self, update: &PivotUpdate, previous: TrendDirection) {
        let pivot = update.pivot();
        debug!(
            pipeline = %self.name,
            kind = %pivot.kind,
            price = pivot.price,
            bar_index = pivot.bar_index,
            replaced = update.is_replacement(),
            "Pivot"
        );
        let state = self.tracker.on_update(update);
        self.risk.on_pivot(pivot);
        if let Some(publisher) = &self.publisher {
            publisher.publish(state);
        }
        if state.direction != previous {
            info!(
                pipeline = %self.name,
                from = ?previous,
                to = ?state.direction,
                "Trend changed"
            );
        }
    }

    async fn act(&mut self, action: RiskAction) {
        let Some(pos) = self.risk.position().cloned() else { return };
        match action {
            RiskAction::None => {}
            RiskAction::RatchetStop(stop_price) => {
                let levels = self.risk.levels().clone();
                match self.slot.sync(pos.side, pos.volume, &levels).await {
                    Ok(StopReplace::AlreadyFilled) => {}
                    Ok(_) => {
                        self.emit(RiskEvent::StopMoved {
                            instrument: self.instrument.clone(),
                            stop_price,
                        })
                        .await;
                    }
                    Err(e) => self.protection_failed(e).await,
                }
            }
            RiskAction::ExitAtMarket { reason, level } => {
                self.emit(RiskEvent::ExitTriggered {
                    instrument: self.instrument.clone(),
                    reason,
                    level,
                })
                .await;
                match self.slot.cancel_all().await {
                    Ok(true) => {
                        info!(pipeline = %self.name, "Protective order already executed, waiting for its fill");
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(pipeline = %self.name, error = %e, "Bracket cancel failed, exiting anyway");
                    }
                }
                match self
                    .gateway
                    .submit_market(&self.instrument, pos.side.exit_order_side(), pos.volume)
                    .await
                {
                    Ok(id) => self.pending_exit = Some(id),
                    Err(e) => {
                        warn!(pipeline = %self.name, error = %e, "Exit order failed, will retry next bar");
                        self.risk.on_order_rejected(RejectedLeg::Exit);
                        self.order_failed(e).await;
                    }
                }
            }
        }
    }

    async fn maybe_enter(
        &mut self,
        bar: &Bar,
        update: Option<&PivotUpdate>,
        previous_direction: TrendDirection,
    ) {
        if !self.risk.is_flat() || self.risk.is_frozen() || self.pending_entry.is_some() {
            return;
        }
        if *self.engine_state.read().await != EngineState::Running {
            return;
        }
        let Some(evaluator) = self.evaluator.as_mut() else { return };
        let ctx = SignalContext {
            bar,
            pivot_update: update,
            trend: self.tracker.state(),
            previous_direction,
            higher_trend: self.higher.as_ref().map(|r| r.direction()),
            position: None,
        };
        let Some(intent) = evaluator.evaluate(&ctx) else { return };

        info!(
            pipeline = %self.name,
            signal = %evaluator.name(),
            side = %intent.side,
            volume = intent.volume,
            close = bar.close,
            "Entry signal"
        );
        match self
            .gateway
            .submit_market(&self.instrument, intent.side.entry_order_side(), intent.volume)
            .await
        {
            Ok(id) => {
                self.risk.expect_entry();
                self.pending_entry = Some(id);
            }
            Err(e) => {
                warn!(pipeline = %self.name, error = %e, "Entry order failed");
                self.order_failed(e).await;
            }
        }
    }

    async fn protection_failed(&mut self, e: Error) {
        warn!(pipeline = %self.name, error = %e, "Protective order failed, will retry next bar");
        self.risk.on_order_rejected(RejectedLeg::Protective);
        self.order_failed(e).await;
    }

    async fn order_failed(&self, e: Error) {
        self.emit(RiskEvent::OrderFailed {
            instrument: self.instrument.clone(),
            error: e.to_string(),
        })
        .await;
    }

    async fn emit(&self, event: RiskEvent) {
        let _ = self.events.send(event).await;
    }

    /// Save the risk snapshot if anything but its timestamp changed.
    async fn persist(&mut self) {
        let Some(store) = &self.store else { return };
        let snapshot = self.risk.snapshot();
        if let Some(prev) = &self.last_saved {
            let mut unchanged = snapshot.clone();
            unchanged.updated_at = prev.updated_at;
            if &unchanged == prev {
                return;
            }
        }
        match store.save(&snapshot).await {
            Ok(()) => self.last_saved = Some(snapshot),
            Err(e) => error!(pipeline = %self.name, error = %e, "Failed to persist risk snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use common::{OrderSide, RiskState, Side, TradeIntent};
    use paper::PaperGateway;
    use strategy::FnEvaluator;

    use crate::cell::trend_cell;
    use crate::config::PipelineFileConfig;

    const CONFIG: &str = r#"
        [[pipeline]]
        name = "eth-1h"
        instrument = "ETHUSDT"
        timeframe_secs = 3600
        volume = 1.0
        max_gap_bars = 2

        [pipeline.pivot]
        depth = 3

        [pipeline.risk.policy]
        type = "fixed_steps"
        price_step = 1.0
        stop_steps = 5

        [pipeline.risk.trailing]
        arm = 5.0
        distance = 3.0
        step = 1.0
    "#;

    struct Harness {
        pipeline: Pipeline,
        gateway: Arc<PaperGateway>,
        fills: mpsc::UnboundedReceiver<Fill>,
        events: mpsc::Receiver<RiskEvent>,
        state: Arc<RwLock<EngineState>>,
    }

    impl Harness {
        async fn new(config: &str, reject_every: Option<u32>) -> Self {
            let cfg = PipelineFileConfig::parse(config).unwrap().pipelines.remove(0);
            let gateway = Arc::new(PaperGateway::new(0.0, reject_every));
            let fills = gateway.subscribe_fills(&cfg.instrument).await;
            let (events_tx, events) = mpsc::channel(1024);
            let state = Arc::new(RwLock::new(EngineState::Running));
            let pipeline = Pipeline::new(&cfg, gateway.clone(), state.clone(), events_tx).unwrap();
            Self {
                pipeline,
                gateway,
                fills,
                events,
                state,
            }
        }

        fn enter_once(mut self, side: Side) -> Self {
            let mut fired = false;
            let eval = FnEvaluator::new("once", move |_ctx: &SignalContext<'_>| {
                if fired {
                    return None;
                }
                fired = true;
                Some(TradeIntent { side, volume: 1.0 })
            });
            self.pipeline = self.pipeline.with_evaluator(Box::new(eval));
            self
        }

        async fn drain_fills(&mut self) {
            while let Ok(fill) = self.fills.try_recv() {
                self.pipeline.on_fill(fill).await.unwrap();
            }
        }

        /// What the run loop does: the gateway sees the bar first, fills are
        /// handled before the bar, and entry fills right after it.
        async fn step(&mut self, bar: &Bar) {
            self.gateway.update_bar(self.pipeline.instrument(), bar).await;
            self.drain_fills().await;
            self.pipeline.on_bar(bar).await.unwrap();
            self.drain_fills().await;
        }

        fn events(&mut self) -> Vec<RiskEvent> {
            let mut out = Vec::new();
            while let Ok(e) = self.events.try_recv() {
                out.push(e);
            }
            out
        }
    }

    fn bar(i: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(i),
            open,
            high,
            low,
            close,
        )
    }

    fn flat(i: i64, price: f64) -> Bar {
        bar(i, price, price, price, price)
    }

    #[tokio::test]
    async fn entry_is_protected_trailed_and_stopped_out() {
        let mut h = Harness::new(CONFIG, None).await.enter_once(Side::Long);

        h.step(&flat(0, 100.0)).await;
        assert_eq!(h.pipeline.risk().state(), RiskState::Protected);
        assert_eq!(h.pipeline.slot().stop().unwrap().price, 95.0);

        h.step(&bar(1, 100.0, 106.0, 100.0, 106.0)).await;
        assert_eq!(h.pipeline.slot().stop().unwrap().price, 103.0);

        h.step(&bar(2, 106.0, 106.0, 101.0, 102.0)).await;
        assert!(h.pipeline.risk().is_flat());
        assert!(h.pipeline.slot().is_empty());

        let events = h.events();
        assert!(matches!(events[0], RiskEvent::PositionOpened { side: Side::Long, .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, RiskEvent::StopMoved { stop_price, .. } if *stop_price == 103.0)));
        assert!(matches!(events.last(), Some(RiskEvent::PositionClosed { .. })));
    }

    #[tokio::test]
    async fn exit_level_hit_cancels_bracket_and_exits_at_market() {
        let mut h = Harness::new(CONFIG, None).await.enter_once(Side::Short);
        h.step(&flat(0, 100.0)).await;
        assert_eq!(h.pipeline.slot().stop().unwrap().price, 105.0);

        // The risk manager sees the bar before the gateway does.
        h.pipeline
            .on_bar(&bar(1, 100.0, 106.0, 99.0, 104.0))
            .await
            .unwrap();
        assert_eq!(h.pipeline.risk().state(), RiskState::ExitRequested);
        assert!(h.pipeline.slot().is_empty());
        h.drain_fills().await;

        assert!(h.pipeline.risk().is_flat());
        let events = h.events();
        assert!(events.iter().any(|e| matches!(e, RiskEvent::ExitTriggered { level, .. } if *level == 105.0)));
        assert!(matches!(events.last(), Some(RiskEvent::PositionClosed { .. })));
    }

    #[tokio::test]
    async fn paused_engine_takes_no_entries() {
        let mut h = Harness::new(CONFIG, None).await.enter_once(Side::Long);
        *h.state.write().await = EngineState::Paused;
        h.step(&flat(0, 100.0)).await;
        assert!(h.pipeline.risk().is_flat());

        *h.state.write().await = EngineState::Running;
        h.step(&flat(1, 100.0)).await;
        assert!(!h.pipeline.risk().is_flat());
    }

    #[tokio::test]
    async fn late_stop_fill_after_market_exit_freezes_instead_of_reversing() {
        let mut h = Harness::new(CONFIG, None).await.enter_once(Side::Long);
        h.step(&flat(0, 100.0)).await;
        let stop = h.pipeline.slot().stop().unwrap().clone();

        let exit_fill = |fill_id: &str, order_id: OrderId, price: f64| Fill {
            fill_id: fill_id.into(),
            order_id,
            instrument: "ETHUSDT".into(),
            side: OrderSide::Sell,
            price,
            volume: 1.0,
            time: Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
        };
        h.pipeline
            .on_fill(exit_fill("exit-1", OrderId("market-exit".into()), 96.0))
            .await
            .unwrap();
        assert!(h.pipeline.risk().is_flat());

        // The stop executed before the cancel reached the venue.
        h.pipeline
            .on_fill(exit_fill("stop-1", stop.id, 95.0))
            .await
            .unwrap();
        assert!(h.pipeline.risk().is_flat());
        assert!(h.pipeline.risk().is_frozen());
        assert!(h.pipeline.slot().is_empty());

        let events = h.events();
        assert!(!events
            .iter()
            .any(|e| matches!(e, RiskEvent::PositionOpened { side: Side::Short, .. })));
        assert!(matches!(events.last(), Some(RiskEvent::Frozen { .. })));
    }

    #[tokio::test]
    async fn replayed_bar_is_ignored() {
        let mut h = Harness::new(CONFIG, None).await;
        let b = flat(0, 100.0);
        h.step(&b).await;
        h.step(&b).await;
        assert_eq!(h.pipeline.detector().bars_seen(), 1);
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn stale_bar_is_reported_and_dropped() {
        let mut h = Harness::new(CONFIG, None).await;
        h.step(&flat(5, 100.0)).await;
        h.step(&flat(3, 100.0)).await;
        assert_eq!(h.pipeline.detector().bars_seen(), 1);
        assert!(matches!(h.events().as_slice(), [RiskEvent::DataGap { .. }]));
    }

    #[tokio::test]
    async fn missing_bars_resync_the_detector() {
        let mut h = Harness::new(CONFIG, None).await;
        h.step(&flat(0, 100.0)).await;
        h.step(&flat(10, 101.0)).await;
        assert_eq!(h.pipeline.detector().bars_seen(), 2);
        assert!(matches!(h.events().as_slice(), [RiskEvent::DataGap { .. }]));
    }

    #[tokio::test]
    async fn rejected_stop_move_is_retried_next_bar() {
        // Every second protective submission is rejected: the initial stop
        // goes through, the first move does not.
        let mut h = Harness::new(CONFIG, Some(2)).await.enter_once(Side::Long);
        h.step(&flat(0, 100.0)).await;
        assert_eq!(h.pipeline.slot().stop().unwrap().price, 95.0);

        h.step(&bar(1, 100.0, 106.0, 100.0, 106.0)).await;
        assert_eq!(h.pipeline.risk().state(), RiskState::Unprotected);
        assert!(h.pipeline.slot().stop().is_none());

        h.step(&flat(2, 105.0)).await;
        assert_eq!(h.pipeline.risk().state(), RiskState::Protected);
        assert_eq!(h.pipeline.slot().stop().unwrap().price, 103.0);
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, RiskEvent::OrderFailed { .. })));
    }

    #[tokio::test]
    async fn publisher_exposes_trend_to_readers() {
        let mut h = Harness::new(CONFIG, None).await;
        let (publisher, reader) = trend_cell();
        h.pipeline = h.pipeline.with_publisher(publisher);

        // High 15, Low 6, then a lower High 12: the trend turns down.
        let highs = [10.0, 11.0, 15.0, 12.0, 8.0, 9.0, 12.0];
        for (i, high) in highs.iter().enumerate() {
            h.step(&bar(i as i64, high - 1.0, *high, high - 2.0, high - 1.0))
                .await;
        }
        assert_eq!(reader.current(), *h.pipeline.trend());
        assert_eq!(reader.direction(), TrendDirection::Down);
    }

    #[tokio::test]
    async fn restored_position_is_protected_again() {
        let store = SnapshotStore::connect("sqlite::memory:").await.unwrap();
        let mut h = Harness::new(CONFIG, None).await.enter_once(Side::Long);
        h.pipeline = h.pipeline.with_store(store.clone());
        h.step(&flat(0, 100.0)).await;
        let before = h.pipeline.risk().position().cloned();

        let mut again = Harness::new(CONFIG, None).await;
        again.pipeline = again.pipeline.with_store(store);
        again.pipeline.restore().await.unwrap();
        assert_eq!(again.pipeline.risk().state(), RiskState::Unprotected);
        assert_eq!(again.pipeline.risk().position().cloned(), before);

        again.step(&flat(1, 100.0)).await;
        assert_eq!(again.pipeline.risk().state(), RiskState::Protected);
        assert_eq!(again.pipeline.slot().stop().unwrap().price, 95.0);
    }

    #[tokio::test]
    async fn run_loop_processes_stream_to_the_end() {
        let h = Harness::new(CONFIG, None).await.enter_once(Side::Long);
        let Harness {
            pipeline,
            gateway,
            mut events,
            ..
        } = h;
        let fills = gateway.subscribe_fills("ETHUSDT").await;
        let (tx, rx) = mpsc::channel(16);
        let bars = paper::tee_bars(gateway.clone(), "ETHUSDT".into(), rx);
        let task = tokio::spawn(pipeline.run(bars, fills));

        tx.send(flat(0, 100.0)).await.unwrap();
        tx.send(bar(1, 100.0, 106.0, 100.0, 106.0)).await.unwrap();
        tx.send(bar(2, 106.0, 106.0, 90.0, 91.0)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let mut seen = Vec::new();
        while let Ok(e) = events.try_recv() {
            seen.push(e);
        }
        assert!(seen
            .iter()
            .any(|e| matches!(e, RiskEvent::PositionOpened { .. })));
        assert!(matches!(seen.last(), Some(RiskEvent::PositionClosed { .. })));
    }
}
