pub mod config;
pub mod indicators;
pub mod pivot;
pub mod registry;
pub mod trend;

pub use config::{AtrConfig, PivotConfig, SignalConfig};
pub use pivot::{BarCheck, PivotDetector};
pub use registry::build_evaluator;
pub use trend::TrendStateTracker;

use common::{Bar, PivotUpdate, Side, TradeIntent, TrendDirection, TrendState};

/// Everything an entry rule may look at for one finished bar.
#[derive(Debug, Clone, Copy)]
pub struct SignalContext<'a> {
    pub bar: &'a Bar,
    /// Pivot change produced by this bar, if any.
    pub pivot_update: Option<&'a PivotUpdate>,
    pub trend: &'a TrendState,
    /// Trend direction before this bar.
    pub previous_direction: TrendDirection,
    /// Latest trend published by a higher-timeframe stream.
    pub higher_trend: Option<TrendDirection>,
    /// Side of the open position, `None` when flat.
    pub position: Option<Side>,
}

impl SignalContext<'_> {
    /// True when this bar changed the trend direction.
    pub fn trend_flipped(&self) -> bool {
        self.trend.direction != self.previous_direction
    }
}

/// All entry rules must satisfy this trait.
///
/// Evaluators are owned by exactly one stream and called once per finished
/// bar, so they may keep private state.
pub trait SignalEvaluator: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Return an intent to open a position, or `None`.
    fn evaluate(&mut self, ctx: &SignalContext<'_>) -> Option<TradeIntent>;
}

/// Adapter turning any closure into a [`SignalEvaluator`].
pub struct FnEvaluator<F> {
    name: String,
    f: F,
}

impl<F> FnEvaluator<F>
where
    F: FnMut(&SignalContext<'_>) -> Option<TradeIntent> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> SignalEvaluator for FnEvaluator<F>
where
    F: FnMut(&SignalContext<'_>) -> Option<TradeIntent> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&mut self, ctx: &SignalContext<'_>) -> Option<TradeIntent> {
        (self.f)(ctx)
    }
}
