use std::collections::HashMap;

use tracing::{debug, info};

use common::{Error, PivotKind, Result, Side, TradeIntent, TrendDirection};

use crate::config::SignalConfig;
use crate::{SignalContext, SignalEvaluator};

/// Build the evaluator named by `cfg.signal_type`.
pub fn build_evaluator(cfg: &SignalConfig, volume: f64) -> Result<Box<dyn SignalEvaluator>> {
    if !(volume.is_finite() && volume > 0.0) {
        return Err(Error::Config(format!("order volume must be positive, got {volume}")));
    }
    let evaluator: Box<dyn SignalEvaluator> = match cfg.signal_type.as_str() {
        "trend_flip" => Box::new(TrendFlip {
            volume,
            allow_short: param_bool(&cfg.params, "allow_short", true),
            require_higher_trend: param_bool(&cfg.params, "require_higher_trend", false),
        }),
        "pivot_breakout" => {
            let threshold = param_f64(&cfg.params, "threshold", 0.0);
            if threshold < 0.0 {
                return Err(Error::Config(format!(
                    "pivot_breakout threshold must not be negative, got {threshold}"
                )));
            }
            Box::new(PivotBreakout {
                volume,
                threshold,
                allow_short: param_bool(&cfg.params, "allow_short", true),
                last_signalled: None,
            })
        }
        other => {
            return Err(Error::Config(format!("unknown signal type '{other}'")));
        }
    };
    info!(signal = %evaluator.name(), volume, "Built signal evaluator");
    Ok(evaluator)
}

fn param_f64(params: &HashMap<String, toml::Value>, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
        .unwrap_or(default)
}

fn param_bool(params: &HashMap<String, toml::Value>, key: &str, default: bool) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

// ─── Concrete evaluators ──────────────────────────────────────────────────────

/// Enter in the direction of a fresh trend flip.
struct TrendFlip {
    volume: f64,
    allow_short: bool,
    /// Only trade when the higher timeframe agrees.
    require_higher_trend: bool,
}

impl SignalEvaluator for TrendFlip {
    fn name(&self) -> &str {
        "trend_flip"
    }

    fn evaluate(&mut self, ctx: &SignalContext<'_>) -> Option<TradeIntent> {
        if ctx.position.is_some() || !ctx.trend_flipped() {
            return None;
        }
        let side = match ctx.trend.direction {
            TrendDirection::Up => Side::Long,
            TrendDirection::Down if self.allow_short => Side::Short,
            _ => return None,
        };
        if self.require_higher_trend {
            let wanted = match side {
                Side::Long => TrendDirection::Up,
                Side::Short => TrendDirection::Down,
            };
            if ctx.higher_trend != Some(wanted) {
                debug!(side = %side, higher = ?ctx.higher_trend, "Trend flip filtered by higher timeframe");
                return None;
            }
        }
        Some(TradeIntent {
            side,
            volume: self.volume,
        })
    }
}

/// Enter when the close breaks the last swing level in the trend direction.
struct PivotBreakout {
    volume: f64,
    threshold: f64,
    allow_short: bool,
    /// Pivot already traded, so one breakout produces one entry.
    last_signalled: Option<(PivotKind, u64)>,
}

impl SignalEvaluator for PivotBreakout {
    fn name(&self) -> &str {
        "pivot_breakout"
    }

    fn evaluate(&mut self, ctx: &SignalContext<'_>) -> Option<TradeIntent> {
        if ctx.position.is_some() {
            return None;
        }
        let (kind, side) = match ctx.trend.direction {
            TrendDirection::Up => (PivotKind::High, Side::Long),
            TrendDirection::Down if self.allow_short => (PivotKind::Low, Side::Short),
            _ => return None,
        };
        let level = [ctx.trend.last_pivot, ctx.trend.previous_pivot]
            .into_iter()
            .flatten()
            .find(|p| p.kind == kind)?;

        let key = (level.kind, level.bar_index);
        if self.last_signalled == Some(key) {
            return None;
        }
        let broken = match side {
            Side::Long => ctx.bar.close > level.price + self.threshold,
            Side::Short => ctx.bar.close < level.price - self.threshold,
        };
        if !broken {
            return None;
        }
        self.last_signalled = Some(key);
        Some(TradeIntent {
            side,
            volume: self.volume,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::{Bar, Pivot, TrendState};

    fn cfg(kind: &str, params: &str) -> SignalConfig {
        toml::from_str(&format!("type = \"{kind}\"\n[params]\n{params}")).unwrap()
    }

    fn pivot(kind: PivotKind, price: f64, bar_index: u64) -> Pivot {
        Pivot {
            kind,
            price,
            bar_index,
            time: Utc.timestamp_opt(bar_index as i64 * 60, 0).unwrap(),
        }
    }

    fn close_bar(close: f64) -> Bar {
        Bar::new(Utc.timestamp_opt(0, 0).unwrap(), close, close, close, close)
    }

    fn ctx<'a>(
        bar: &'a Bar,
        trend: &'a TrendState,
        previous: TrendDirection,
        higher: Option<TrendDirection>,
    ) -> SignalContext<'a> {
        SignalContext {
            bar,
            pivot_update: None,
            trend,
            previous_direction: previous,
            higher_trend: higher,
            position: None,
        }
    }

    #[test]
    fn unknown_type_is_a_config_error() {
        let err = build_evaluator(&cfg("rsi", ""), 1.0).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn non_positive_volume_is_a_config_error() {
        assert!(build_evaluator(&cfg("trend_flip", ""), 0.0).is_err());
    }

    #[test]
    fn trend_flip_enters_on_flip_only() {
        let mut eval = build_evaluator(&cfg("trend_flip", ""), 2.0).unwrap();
        let bar = close_bar(10.0);
        let trend = TrendState {
            direction: TrendDirection::Up,
            ..TrendState::default()
        };
        let intent = eval.evaluate(&ctx(&bar, &trend, TrendDirection::Flat, None));
        assert_eq!(
            intent,
            Some(TradeIntent {
                side: Side::Long,
                volume: 2.0
            })
        );
        assert!(eval
            .evaluate(&ctx(&bar, &trend, TrendDirection::Up, None))
            .is_none());
    }

    #[test]
    fn trend_flip_respects_higher_timeframe_gate() {
        let mut eval =
            build_evaluator(&cfg("trend_flip", "require_higher_trend = true"), 1.0).unwrap();
        let bar = close_bar(10.0);
        let trend = TrendState {
            direction: TrendDirection::Down,
            ..TrendState::default()
        };
        assert!(eval
            .evaluate(&ctx(&bar, &trend, TrendDirection::Up, Some(TrendDirection::Up)))
            .is_none());
        let intent = eval.evaluate(&ctx(
            &bar,
            &trend,
            TrendDirection::Up,
            Some(TrendDirection::Down),
        ));
        assert_eq!(intent.map(|i| i.side), Some(Side::Short));
    }

    #[test]
    fn shorts_can_be_disabled() {
        let mut eval = build_evaluator(&cfg("trend_flip", "allow_short = false"), 1.0).unwrap();
        let bar = close_bar(10.0);
        let trend = TrendState {
            direction: TrendDirection::Down,
            ..TrendState::default()
        };
        assert!(eval
            .evaluate(&ctx(&bar, &trend, TrendDirection::Up, None))
            .is_none());
    }

    #[test]
    fn breakout_fires_once_per_pivot() {
        let mut eval = build_evaluator(&cfg("pivot_breakout", "threshold = 0.5"), 1.0).unwrap();
        let trend = TrendState {
            direction: TrendDirection::Up,
            last_pivot: Some(pivot(PivotKind::Low, 95.0, 8)),
            previous_pivot: Some(pivot(PivotKind::High, 100.0, 5)),
        };
        let below = close_bar(100.4);
        assert!(eval
            .evaluate(&ctx(&below, &trend, TrendDirection::Up, None))
            .is_none());
        let above = close_bar(100.6);
        let intent = eval.evaluate(&ctx(&above, &trend, TrendDirection::Up, None));
        assert_eq!(intent.map(|i| i.side), Some(Side::Long));
        assert!(eval
            .evaluate(&ctx(&above, &trend, TrendDirection::Up, None))
            .is_none());
    }

    #[test]
    fn closure_evaluator_is_a_signal_evaluator() {
        let mut calls = 0;
        let mut eval = crate::FnEvaluator::new("always_long", move |_ctx| {
            calls += 1;
            Some(TradeIntent {
                side: Side::Long,
                volume: calls as f64,
            })
        });
        let bar = close_bar(1.0);
        let trend = TrendState::default();
        assert_eq!(eval.name(), "always_long");
        let first = eval.evaluate(&ctx(&bar, &trend, TrendDirection::Flat, None));
        let second = eval.evaluate(&ctx(&bar, &trend, TrendDirection::Flat, None));
        assert_eq!(first.unwrap().volume, 1.0);
        assert_eq!(second.unwrap().volume, 2.0);
    }

    #[test]
    fn boxed_evaluators_can_move_between_tasks() {
        fn shareable<T: Send + Sync + ?Sized>() {}
        shareable::<dyn SignalEvaluator>();
        shareable::<Box<dyn SignalEvaluator>>();
    }
}
