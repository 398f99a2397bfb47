use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use common::{Bar, Error, Pivot, PivotKind, PivotUpdate, Result};

use crate::config::PivotConfig;

/// How a finished bar relates to what the detector has already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarCheck {
    Fresh,
    /// Identical to the last accepted bar.
    Replay,
}

#[derive(Debug, Clone, Copy)]
struct WindowBar {
    index: u64,
    high: f64,
    low: f64,
}

/// ZigZag-style swing detector for one (instrument, timeframe) stream.
///
/// A bar becomes a candidate High when its high is the strict maximum of the
/// last `depth` bars (earlier equal highs win) and a candidate Low likewise.
/// Candidates are confirmed as follows:
///
/// - the very first pivot is accepted as is;
/// - a reversal (kind differs from the last pivot) needs `backstep` bars since
///   that pivot and must lie beyond it;
/// - a same-kind candidate that improves the last pivot by a strictly positive
///   amount of at least `deviation` replaces it.
///
/// Because same-kind candidates can only replace, the pivot sequence always
/// alternates between highs and lows.
pub struct PivotDetector {
    instrument: String,
    config: PivotConfig,
    /// Longest allowed distance between consecutive bar open times.
    max_interval: Option<chrono::Duration>,
    window: VecDeque<WindowBar>,
    next_index: u64,
    last_bar: Option<Bar>,
    pivots: VecDeque<Pivot>,
}

impl PivotDetector {
    pub fn new(instrument: impl Into<String>, config: PivotConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            instrument: instrument.into(),
            window: VecDeque::with_capacity(config.depth),
            config,
            max_interval: None,
            next_index: 0,
            last_bar: None,
            pivots: VecDeque::new(),
        })
    }

    /// Treat any open-time jump larger than `interval` as missing bars.
    pub fn with_max_interval(mut self, interval: chrono::Duration) -> Self {
        self.max_interval = Some(interval);
        self
    }

    pub fn config(&self) -> &PivotConfig {
        &self.config
    }

    /// Confirmed pivots, oldest first.
    pub fn pivots(&self) -> impl Iterator<Item = &Pivot> {
        self.pivots.iter()
    }

    pub fn last_pivot(&self) -> Option<&Pivot> {
        self.pivots.back()
    }

    /// Most recent pivot of the given kind.
    pub fn last_of(&self, kind: PivotKind) -> Option<&Pivot> {
        self.pivots.iter().rev().find(|p| p.kind == kind)
    }

    /// Number of finished bars accepted so far.
    pub fn bars_seen(&self) -> u64 {
        self.next_index
    }

    /// Validate a finished bar against the stream history without mutating
    /// anything.
    pub fn check(&self, bar: &Bar) -> Result<BarCheck> {
        if !(bar.high.is_finite() && bar.low.is_finite()) || bar.high < bar.low {
            return Err(self.gap(format!(
                "malformed bar at {}: high={} low={}",
                bar.open_time, bar.high, bar.low
            )));
        }

        let Some(last) = &self.last_bar else {
            return Ok(BarCheck::Fresh);
        };

        if bar.open_time == last.open_time {
            if bar == last {
                return Ok(BarCheck::Replay);
            }
            return Err(self.gap(format!(
                "conflicting bar for already processed time {}",
                bar.open_time
            )));
        }
        if bar.open_time < last.open_time {
            return Err(self.gap(format!(
                "non-monotonic timestamp {} after {}",
                bar.open_time, last.open_time
            )));
        }
        if let Some(max) = self.max_interval {
            let elapsed = bar.open_time - last.open_time;
            if elapsed > max {
                return Err(self.gap(format!(
                    "missing bars between {} and {}",
                    last.open_time, bar.open_time
                )));
            }
        }
        Ok(BarCheck::Fresh)
    }

    /// Feed one bar. Partial bars and exact replays are ignored.
    ///
    /// On a data gap the detector state is left untouched and the error is
    /// returned; call [`resync`](Self::resync) to continue past it.
    pub fn on_bar(&mut self, bar: &Bar) -> Result<Option<PivotUpdate>> {
        if !bar.is_final {
            return Ok(None);
        }
        if self.check(bar)? == BarCheck::Replay {
            trace!(instrument = %self.instrument, time = %bar.open_time, "Replayed bar ignored");
            return Ok(None);
        }

        let index = self.next_index;
        self.next_index += 1;
        self.last_bar = Some(bar.clone());
        self.window.push_back(WindowBar {
            index,
            high: bar.high,
            low: bar.low,
        });
        while self.window.len() > self.config.depth {
            self.window.pop_front();
        }
        if self.window.len() < self.config.depth {
            return Ok(None);
        }

        let is_high = self
            .window
            .iter()
            .filter(|w| w.index != index)
            .all(|w| w.high < bar.high);
        let is_low = self
            .window
            .iter()
            .filter(|w| w.index != index)
            .all(|w| w.low > bar.low);

        // An outside bar is read as a reversal first; with no history the
        // body direction decides.
        let order = match self.pivots.back().map(|p| p.kind) {
            Some(PivotKind::High) => [PivotKind::Low, PivotKind::High],
            Some(PivotKind::Low) => [PivotKind::High, PivotKind::Low],
            None if bar.close >= bar.open => [PivotKind::High, PivotKind::Low],
            None => [PivotKind::Low, PivotKind::High],
        };

        for kind in order {
            let (is_candidate, price) = match kind {
                PivotKind::High => (is_high, bar.high),
                PivotKind::Low => (is_low, bar.low),
            };
            if !is_candidate {
                continue;
            }
            if let Some(update) = self.confirm(kind, price, index, bar.open_time) {
                return Ok(Some(update));
            }
        }
        Ok(None)
    }

    /// Forget the extremum window and the last bar so the stream can restart
    /// after a reported gap. Pivot history and bar numbering are kept.
    pub fn resync(&mut self) {
        debug!(instrument = %self.instrument, "Pivot detector resynchronised");
        self.window.clear();
        self.last_bar = None;
    }

    fn confirm(
        &mut self,
        kind: PivotKind,
        price: f64,
        bar_index: u64,
        time: DateTime<Utc>,
    ) -> Option<PivotUpdate> {
        let pivot = Pivot {
            kind,
            price,
            bar_index,
            time,
        };

        let Some(last) = self.pivots.back().copied() else {
            self.push(pivot);
            debug!(instrument = %self.instrument, kind = %kind, price, bar_index, "First pivot");
            return Some(PivotUpdate::Confirmed(pivot));
        };

        if last.kind != kind {
            let elapsed = bar_index.saturating_sub(last.bar_index);
            let beyond = match kind {
                PivotKind::High => price > last.price,
                PivotKind::Low => price < last.price,
            };
            if elapsed < self.config.backstep || !beyond {
                return None;
            }
            self.push(pivot);
            debug!(instrument = %self.instrument, kind = %kind, price, bar_index, "Pivot confirmed");
            return Some(PivotUpdate::Confirmed(pivot));
        }

        let improvement = match kind {
            PivotKind::High => price - last.price,
            PivotKind::Low => last.price - price,
        };
        if improvement <= 0.0 || improvement < self.config.deviation {
            return None;
        }
        if let Some(slot) = self.pivots.back_mut() {
            *slot = pivot;
        }
        debug!(
            instrument = %self.instrument,
            kind = %kind,
            from = last.price,
            to = price,
            bar_index,
            "Pivot replaced"
        );
        Some(PivotUpdate::Replaced {
            previous: last,
            current: pivot,
        })
    }

    fn push(&mut self, pivot: Pivot) {
        self.pivots.push_back(pivot);
        while self.pivots.len() > self.config.history_limit {
            self.pivots.pop_front();
        }
    }

    fn gap(&self, detail: String) -> Error {
        Error::DataGap {
            instrument: self.instrument.clone(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(i)
    }

    fn bar(i: i64, high: f64, low: f64) -> Bar {
        Bar::new(t(i), low, high, low, high)
    }

    fn feed(det: &mut PivotDetector, bars: &[(f64, f64)]) -> Vec<(u64, PivotUpdate)> {
        bars.iter()
            .enumerate()
            .filter_map(|(i, &(h, l))| {
                det.on_bar(&bar(i as i64, h, l))
                    .unwrap()
                    .map(|u| (i as u64, u))
            })
            .collect()
    }

    #[test]
    fn construction_rejects_shallow_depth() {
        assert!(matches!(
            PivotDetector::new("X", PivotConfig::new(1, 0.0, 0)),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            PivotDetector::new("X", PivotConfig::new(3, -1.0, 0)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn high_is_replaced_before_low_confirms() {
        // highs [1,3,2,5,4,6,1], lows one below
        let mut det = PivotDetector::new("X", PivotConfig::new(3, 0.0, 0)).unwrap();
        let highs = [1.0, 3.0, 2.0, 5.0, 4.0, 6.0, 1.0];
        let bars: Vec<(f64, f64)> = highs.iter().map(|&h| (h, h - 1.0)).collect();
        let updates = feed(&mut det, &bars);

        assert_eq!(updates.len(), 3);
        match updates[0] {
            (3, PivotUpdate::Confirmed(p)) => {
                assert_eq!(p.kind, PivotKind::High);
                assert_eq!(p.price, 5.0);
            }
            other => panic!("unexpected first update {other:?}"),
        }
        match updates[1] {
            (5, PivotUpdate::Replaced { previous, current }) => {
                assert_eq!(previous.price, 5.0);
                assert_eq!(current.price, 6.0);
                assert_eq!(current.bar_index, 5);
            }
            other => panic!("unexpected second update {other:?}"),
        }
        match updates[2] {
            (6, PivotUpdate::Confirmed(p)) => assert_eq!(p.kind, PivotKind::Low),
            other => panic!("unexpected third update {other:?}"),
        }
        let kinds: Vec<_> = det.pivots().map(|p| (p.kind, p.price)).collect();
        assert_eq!(kinds, vec![(PivotKind::High, 6.0), (PivotKind::Low, 0.0)]);
    }

    #[test]
    fn nothing_is_emitted_during_warm_up() {
        let mut det = PivotDetector::new("X", PivotConfig::new(4, 0.0, 0)).unwrap();
        let updates = feed(&mut det, &[(1.0, 0.5), (2.0, 1.5), (3.0, 2.5)]);
        assert!(updates.is_empty());
        assert_eq!(det.bars_seen(), 3);
    }

    #[test]
    fn equal_high_does_not_become_candidate() {
        let mut det = PivotDetector::new("X", PivotConfig::new(3, 0.0, 0)).unwrap();
        // 5.0 first appears at bar 2; bar 3 ties it and must not replace it.
        let updates = feed(&mut det, &[(1.0, 0.5), (2.0, 1.5), (5.0, 4.5), (5.0, 4.6)]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.pivot().bar_index, 2);
    }

    #[test]
    fn deviation_blocks_small_corrections() {
        let mut det = PivotDetector::new("X", PivotConfig::new(2, 1.0, 0)).unwrap();
        let updates = feed(&mut det, &[(1.0, 0.9), (2.0, 1.9), (2.5, 2.4), (3.5, 3.4)]);
        // 2.0 confirmed, 2.5 is only +0.5, 3.5 is +1.5 over 2.0
        assert_eq!(updates.len(), 2);
        assert!(updates[1].1.is_replacement());
        assert_eq!(updates[1].1.pivot().price, 3.5);
    }

    #[test]
    fn backstep_delays_reversal() {
        let mut det = PivotDetector::new("X", PivotConfig::new(2, 0.0, 3)).unwrap();
        // High at bar 1; lows fall at bars 2, 3 and 4.
        let updates = feed(
            &mut det,
            &[(1.0, 0.5), (5.0, 4.0), (4.0, 3.0), (3.5, 2.0), (3.0, 1.0)],
        );
        let confirmed: Vec<_> = updates.iter().map(|(i, u)| (*i, u.pivot().kind)).collect();
        assert_eq!(
            confirmed,
            vec![(1, PivotKind::High), (4, PivotKind::Low)],
            "low must wait three bars after the high"
        );
    }

    #[test]
    fn replayed_bar_is_ignored() {
        let mut det = PivotDetector::new("X", PivotConfig::new(2, 0.0, 0)).unwrap();
        let b0 = bar(0, 1.0, 0.5);
        let b1 = bar(1, 2.0, 1.5);
        det.on_bar(&b0).unwrap();
        assert!(det.on_bar(&b1).unwrap().is_some());
        assert_eq!(det.check(&b1).unwrap(), BarCheck::Replay);
        assert!(det.on_bar(&b1).unwrap().is_none());
        assert_eq!(det.pivots().count(), 1);
        assert_eq!(det.bars_seen(), 2);
    }

    #[test]
    fn partial_bars_do_not_touch_state() {
        let mut det = PivotDetector::new("X", PivotConfig::new(2, 0.0, 0)).unwrap();
        let mut partial = bar(0, 1.0, 0.5);
        partial.is_final = false;
        assert!(det.on_bar(&partial).unwrap().is_none());
        assert_eq!(det.bars_seen(), 0);
    }

    #[test]
    fn out_of_order_bar_is_a_data_gap() {
        let mut det = PivotDetector::new("X", PivotConfig::new(2, 0.0, 0)).unwrap();
        det.on_bar(&bar(5, 1.0, 0.5)).unwrap();
        let err = det.on_bar(&bar(4, 2.0, 1.0)).unwrap_err();
        assert!(matches!(err, Error::DataGap { .. }));
        assert_eq!(det.bars_seen(), 1);
    }

    #[test]
    fn conflicting_replay_is_a_data_gap() {
        let mut det = PivotDetector::new("X", PivotConfig::new(2, 0.0, 0)).unwrap();
        det.on_bar(&bar(0, 1.0, 0.5)).unwrap();
        let err = det.on_bar(&bar(0, 1.2, 0.5)).unwrap_err();
        assert!(matches!(err, Error::DataGap { .. }));
    }

    #[test]
    fn missing_bars_are_reported_and_resync_recovers() {
        let mut det = PivotDetector::new("X", PivotConfig::new(2, 0.0, 0))
            .unwrap()
            .with_max_interval(Duration::minutes(1));
        det.on_bar(&bar(0, 1.0, 0.5)).unwrap();
        let gap = bar(10, 2.0, 1.5);
        assert!(matches!(det.on_bar(&gap), Err(Error::DataGap { .. })));
        assert_eq!(det.bars_seen(), 1);

        det.resync();
        assert!(det.on_bar(&gap).unwrap().is_none(), "window restarts warm-up");
        assert_eq!(det.bars_seen(), 2);
    }

    #[test]
    fn history_is_bounded() {
        let mut cfg = PivotConfig::new(2, 0.0, 0);
        cfg.history_limit = 4;
        let mut det = PivotDetector::new("X", cfg).unwrap();
        // Every bar widens both extremes, so pivots alternate on each bar.
        let bars: Vec<(f64, f64)> = (0..40)
            .map(|i| (100.0 + i as f64, 50.0 - i as f64))
            .collect();
        let updates = feed(&mut det, &bars);
        assert!(updates.len() > 10);
        assert_eq!(det.pivots().count(), 4);
    }
}
