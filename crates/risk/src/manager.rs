use std::collections::{HashSet, VecDeque};

use tracing::{debug, error, info, warn};

use common::{
    Bar, Error, ExitReason, Fill, Pivot, PivotKind, Position, ProtectiveLevels, RejectedLeg,
    Result, RiskAction, RiskState, Side,
};

use crate::config::{PolicyInputs, RiskConfig};
use crate::snapshot::RiskSnapshot;

/// Number of fill ids remembered for duplicate detection.
const SEEN_FILLS_CAPACITY: usize = 1024;

/// Volumes closer than this are treated as equal.
const VOLUME_EPSILON: f64 = 1e-9;

/// How a fill changed the tracked position.
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// A position was opened from flat with these initial levels.
    Opened(ProtectiveLevels),
    /// An exit fill reduced the position; the bracket must be resized.
    Reduced(ProtectiveLevels),
    /// The position is flat and the levels are cleared.
    Closed,
    /// The fill had been applied before.
    Duplicate,
}

/// Owns the protective-level state machine for the position of one
/// instrument.
///
/// ```text
/// Flat ─fill─▶ Unprotected ─stop placed─▶ Protected ─exit hit─▶ ExitRequested ─fill─▶ Flat
///                   ▲                        │
///                   └──── order rejected ────┘
/// ```
///
/// Every call is synchronous and driven from the stream's own task; the
/// manager never talks to the gateway itself.
pub struct PositionRiskManager {
    instrument: String,
    config: RiskConfig,
    state: RiskState,
    position: Option<Position>,
    levels: ProtectiveLevels,
    atr: Option<f64>,
    last_high: Option<Pivot>,
    last_low: Option<Pivot>,
    /// Adverse swing waiting to be applied on the next bar.
    pending_anchor: Option<Pivot>,
    /// Whether a fill while flat may open a position. Cleared once a
    /// position opens so a late exit fill cannot open the opposite side.
    entry_expected: bool,
    seen_fills: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl PositionRiskManager {
    pub fn new(instrument: impl Into<String>, config: RiskConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            instrument: instrument.into(),
            config,
            state: RiskState::Flat,
            position: None,
            levels: ProtectiveLevels::default(),
            atr: None,
            last_high: None,
            last_low: None,
            pending_anchor: None,
            entry_expected: true,
            seen_fills: HashSet::new(),
            seen_order: VecDeque::new(),
        })
    }

    /// Rebuild a manager from a persisted snapshot.
    ///
    /// Live protective orders are unknown after a restart, so an open
    /// position comes back Unprotected and its stop is re-placed on the next
    /// bar.
    pub fn restore(config: RiskConfig, snapshot: &RiskSnapshot) -> Result<Self> {
        let mut manager = Self::new(snapshot.instrument.clone(), config)?;
        manager.entry_expected = false;
        let position = snapshot.position()?;
        manager.state = match (snapshot.state, &position) {
            (RiskState::Flat, _) | (_, None) => RiskState::Flat,
            (RiskState::Frozen, Some(_)) => RiskState::Frozen,
            (_, Some(_)) => RiskState::Unprotected,
        };
        if manager.state != RiskState::Flat {
            manager.position = position;
            manager.levels = snapshot.levels();
        }
        info!(
            instrument = %manager.instrument,
            state = %manager.state,
            "Risk state restored from snapshot"
        );
        Ok(manager)
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn state(&self) -> RiskState {
        self.state
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn levels(&self) -> &ProtectiveLevels {
        &self.levels
    }

    pub fn is_flat(&self) -> bool {
        self.position.is_none()
    }

    pub fn is_frozen(&self) -> bool {
        self.state == RiskState::Frozen
    }

    /// Announce an entry order. The next fill while flat opens a position;
    /// without this only a brand-new manager accepts an opening fill.
    pub fn expect_entry(&mut self) {
        self.entry_expected = true;
    }

    /// Latest ATR reading for the ATR-multiple policy. `None` keeps the last
    /// known value.
    pub fn update_atr(&mut self, atr: Option<f64>) {
        if let Some(atr) = atr.filter(|v| v.is_finite() && *v > 0.0) {
            self.atr = Some(atr);
        }
    }

    /// Record a confirmed (or corrected) pivot.
    ///
    /// Pivots feed the pivot policy while flat. With a position open, a swing
    /// against the position (a Low under a long, a High over a short) is
    /// queued for the pivot-anchored stop on the next bar.
    pub fn on_pivot(&mut self, pivot: &Pivot) {
        match pivot.kind {
            PivotKind::High => self.last_high = Some(*pivot),
            PivotKind::Low => self.last_low = Some(*pivot),
        }
        if let Some(pos) = &self.position {
            let adverse = match pos.side {
                Side::Long => PivotKind::Low,
                Side::Short => PivotKind::High,
            };
            if pivot.kind == adverse && pivot.time >= pos.open_time {
                self.pending_anchor = Some(*pivot);
            }
        }
    }

    /// Reconcile an execution report against the tracked position.
    pub fn on_fill(&mut self, fill: &Fill) -> Result<FillOutcome> {
        if self.seen_fills.contains(&fill.fill_id) {
            debug!(instrument = %self.instrument, fill_id = %fill.fill_id, "Duplicate fill ignored");
            return Ok(FillOutcome::Duplicate);
        }
        if self.state == RiskState::Frozen {
            return Err(self.mismatch(format!(
                "fill {} received while risk management is frozen",
                fill.fill_id
            )));
        }
        if fill.instrument != self.instrument {
            return Err(self.freeze(format!(
                "fill {} is for instrument {}",
                fill.fill_id, fill.instrument
            )));
        }
        if !(fill.volume.is_finite() && fill.volume > 0.0 && fill.price.is_finite()) {
            return Err(self.freeze(format!(
                "fill {} has volume {} at price {}",
                fill.fill_id, fill.volume, fill.price
            )));
        }
        self.remember_fill(&fill.fill_id);

        let Some(pos) = self.position.as_mut() else {
            if !self.entry_expected {
                let detail = format!(
                    "{} fill {} of {} while flat with no entry order outstanding",
                    fill.side, fill.fill_id, fill.volume
                );
                return Err(self.freeze(detail));
            }
            self.entry_expected = false;
            let side = fill.side.opens();
            self.position = Some(Position {
                side,
                volume: fill.volume,
                entry_price: fill.price,
                open_time: fill.time,
            });
            self.levels = ProtectiveLevels {
                trailing_anchor: Some(fill.price),
                ..ProtectiveLevels::default()
            };
            self.pending_anchor = None;
            self.apply_initial_levels();
            self.state = if self.levels.stop_price.is_some() {
                RiskState::Protected
            } else {
                RiskState::Unprotected
            };
            info!(
                instrument = %self.instrument,
                side = %side,
                entry = fill.price,
                volume = fill.volume,
                stop = ?self.levels.stop_price,
                take = ?self.levels.take_price,
                "Position opened"
            );
            return Ok(FillOutcome::Opened(self.levels.clone()));
        };

        if fill.side != pos.side.exit_order_side() {
            let detail = format!(
                "{} fill {} while a {} position is open",
                fill.side, fill.fill_id, pos.side
            );
            return Err(self.freeze(detail));
        }

        let remaining = pos.volume - fill.volume;
        if remaining.abs() <= VOLUME_EPSILON * pos.volume.max(1.0) {
            info!(
                instrument = %self.instrument,
                exit = fill.price,
                entry = pos.entry_price,
                "Position closed"
            );
            self.on_close();
            return Ok(FillOutcome::Closed);
        }
        if remaining < 0.0 {
            let detail = format!(
                "exit fill {} of {} exceeds open volume {}",
                fill.fill_id, fill.volume, pos.volume
            );
            return Err(self.freeze(detail));
        }
        pos.volume = remaining;
        info!(
            instrument = %self.instrument,
            remaining,
            "Position reduced"
        );
        Ok(FillOutcome::Reduced(self.levels.clone()))
    }

    /// Evaluate one finished bar for an open position.
    ///
    /// Order of evaluation: exit against the full bar range (the stop wins if
    /// both levels are touched), then break-even, trailing and the
    /// pivot-anchored stop. Stop changes only ever tighten.
    pub fn on_bar(&mut self, bar: &Bar) -> Result<RiskAction> {
        if !bar.is_final {
            return Ok(RiskAction::None);
        }
        let pos = match (self.state, &self.position) {
            (RiskState::Unprotected | RiskState::Protected, Some(pos)) => pos.clone(),
            (RiskState::Frozen, _) => {
                debug!(instrument = %self.instrument, "Risk management frozen, bar skipped");
                return Ok(RiskAction::None);
            }
            _ => return Ok(RiskAction::None),
        };
        let sign = pos.side.sign();

        if let Some(action) = self.exit_check(&pos, bar) {
            self.state = RiskState::ExitRequested;
            if let RiskAction::ExitAtMarket { reason, level } = action {
                info!(
                    instrument = %self.instrument,
                    reason = %reason,
                    level,
                    low = bar.low,
                    high = bar.high,
                    "Exit level hit"
                );
            }
            return Ok(action);
        }

        let anchor = match self.levels.trailing_anchor {
            Some(a) if (bar.close - a) * sign <= 0.0 => a,
            _ => bar.close,
        };
        self.levels.trailing_anchor = Some(anchor);
        let excursion = (anchor - pos.entry_price) * sign;
        let before = self.levels.stop_price;

        if self.state == RiskState::Unprotected {
            self.apply_initial_levels();
        }

        if let Some(be) = &self.config.break_even {
            if !self.levels.break_even_applied && excursion >= be.trigger {
                let candidate = pos.entry_price + sign * be.offset;
                if !self.tightens(candidate, sign) {
                    // The stop is already past break-even.
                    self.levels.break_even_applied = true;
                } else if self.protective(candidate, bar.close, sign) {
                    debug!(instrument = %self.instrument, stop = candidate, "Break-even applied");
                    self.levels.stop_price = Some(candidate);
                    self.levels.break_even_applied = true;
                }
            }
        }

        if let Some(tr) = &self.config.trailing {
            if !self.levels.trailing_armed && excursion >= tr.arm {
                self.levels.trailing_armed = true;
                debug!(instrument = %self.instrument, excursion, "Trailing stop armed");
            }
            if self.levels.trailing_armed {
                let candidate = bar.close - sign * tr.distance;
                let adopt = match self.levels.stop_price {
                    None => true,
                    Some(stop) => (candidate - stop) * sign >= tr.step,
                };
                if adopt && self.protective(candidate, bar.close, sign) {
                    self.levels.stop_price = Some(candidate);
                }
            }
        }

        if let Some(pivot) = self.pending_anchor.take() {
            if let Some(pa) = &self.config.pivot_anchor {
                let candidate = pivot.price - sign * pa.buffer;
                if self.protective(candidate, bar.close, sign) && self.tightens(candidate, sign) {
                    debug!(
                        instrument = %self.instrument,
                        pivot = pivot.price,
                        stop = candidate,
                        "Stop anchored to swing"
                    );
                    self.levels.stop_price = Some(candidate);
                }
            }
        }

        let after = self.levels.stop_price;
        match after {
            Some(stop) if after != before || self.state == RiskState::Unprotected => {
                self.state = RiskState::Protected;
                info!(
                    instrument = %self.instrument,
                    from = ?before,
                    to = stop,
                    "Stop ratcheted"
                );
                Ok(RiskAction::RatchetStop(stop))
            }
            _ => Ok(RiskAction::None),
        }
    }

    /// The gateway refused an order this manager asked for.
    ///
    /// Nothing is assumed to have succeeded: the next bar recomputes and
    /// re-requests protection, or re-checks the exit.
    pub fn on_order_rejected(&mut self, leg: RejectedLeg) {
        match (leg, self.state) {
            (RejectedLeg::Protective, RiskState::Protected)
            | (RejectedLeg::Exit, RiskState::ExitRequested) => {
                warn!(instrument = %self.instrument, leg = ?leg, "Order rejected, protection will be re-requested");
                self.state = RiskState::Unprotected;
            }
            _ => {}
        }
    }

    /// Clear the position and its levels. Calling it again is a no-op.
    pub fn on_close(&mut self) {
        if self.position.is_none() && self.state == RiskState::Flat {
            return;
        }
        self.position = None;
        self.levels = ProtectiveLevels::default();
        self.pending_anchor = None;
        self.state = RiskState::Flat;
    }

    /// Explicit host resolution after a reconciliation mismatch.
    pub fn resolve(&mut self, position: Option<Position>) {
        info!(instrument = %self.instrument, position = ?position, "Risk state resolved externally");
        self.on_close();
        self.state = RiskState::Flat;
        if let Some(pos) = position {
            self.levels = ProtectiveLevels {
                trailing_anchor: Some(pos.entry_price),
                ..ProtectiveLevels::default()
            };
            self.position = Some(pos);
            self.apply_initial_levels();
            self.state = RiskState::Unprotected;
        }
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        RiskSnapshot::capture(
            &self.instrument,
            self.state,
            self.position.as_ref(),
            &self.levels,
        )
    }

    fn exit_check(&self, pos: &Position, bar: &Bar) -> Option<RiskAction> {
        let (stop_hit, take_hit) = match pos.side {
            Side::Long => (
                self.levels.stop_price.filter(|s| bar.low <= *s),
                self.levels.take_price.filter(|t| bar.high >= *t),
            ),
            Side::Short => (
                self.levels.stop_price.filter(|s| bar.high >= *s),
                self.levels.take_price.filter(|t| bar.low <= *t),
            ),
        };
        if let Some(level) = stop_hit {
            return Some(RiskAction::ExitAtMarket {
                reason: ExitReason::StopLoss,
                level,
            });
        }
        take_hit.map(|level| RiskAction::ExitAtMarket {
            reason: ExitReason::TakeProfit,
            level,
        })
    }

    /// Fill in whichever initial level is still unset.
    fn apply_initial_levels(&mut self) {
        let Some(pos) = &self.position else { return };
        let inputs = PolicyInputs {
            atr: self.atr,
            last_high: self.last_high,
            last_low: self.last_low,
        };
        let (stop, take) = self
            .config
            .policy
            .initial_levels(pos.side, pos.entry_price, &inputs);
        if self.levels.stop_price.is_none() {
            self.levels.stop_price = stop;
        }
        if self.levels.take_price.is_none() {
            self.levels.take_price = take;
        }
    }

    fn tightens(&self, candidate: f64, sign: f64) -> bool {
        self.levels
            .stop_price
            .map_or(true, |stop| (candidate - stop) * sign > 0.0)
    }

    /// A stop must stay on the loss side of the current price.
    fn protective(&self, candidate: f64, close: f64, sign: f64) -> bool {
        (close - candidate) * sign > 0.0
    }

    fn remember_fill(&mut self, fill_id: &str) {
        if self.seen_fills.insert(fill_id.to_string()) {
            self.seen_order.push_back(fill_id.to_string());
            while self.seen_order.len() > SEEN_FILLS_CAPACITY {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen_fills.remove(&old);
                }
            }
        }
    }

    fn mismatch(&self, detail: String) -> Error {
        Error::ReconciliationMismatch {
            instrument: self.instrument.clone(),
            detail,
        }
    }

    fn freeze(&mut self, detail: String) -> Error {
        error!(instrument = %self.instrument, detail = %detail, "Reconciliation mismatch, freezing risk management");
        self.state = RiskState::Frozen;
        self.mismatch(detail)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
