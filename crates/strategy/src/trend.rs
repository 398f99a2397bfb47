use tracing::debug;

use common::{Pivot, PivotKind, PivotUpdate, TrendDirection, TrendState};

/// Coarse trend flag derived from consecutive swing points.
///
/// A new High above the prior High, or a new Low above the prior Low, turns
/// the trend Up; the mirror turns it Down. Equal prices leave it unchanged,
/// and nothing is decided until a kind has been seen twice.
#[derive(Debug, Default, Clone)]
pub struct TrendStateTracker {
    state: TrendState,
    last_high: Option<Pivot>,
    prior_high: Option<Pivot>,
    last_low: Option<Pivot>,
    prior_low: Option<Pivot>,
}

impl TrendStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &TrendState {
        &self.state
    }

    pub fn direction(&self) -> TrendDirection {
        self.state.direction
    }

    /// Apply a detector update. A replacement re-derives the trend from the
    /// corrected pivot.
    pub fn on_update(&mut self, update: &PivotUpdate) -> TrendState {
        self.on_pivot(update.pivot())
    }

    /// Apply a confirmed pivot. A pivot of the same kind as the last one is
    /// treated as a correction of it; feeding the same pivot twice is a no-op.
    pub fn on_pivot(&mut self, pivot: &Pivot) -> TrendState {
        if self.state.last_pivot.as_ref() == Some(pivot) {
            return self.state;
        }

        let correction = self
            .state
            .last_pivot
            .map(|last| last.kind == pivot.kind)
            .unwrap_or(false);

        let (last, prior) = match pivot.kind {
            PivotKind::High => (&mut self.last_high, &mut self.prior_high),
            PivotKind::Low => (&mut self.last_low, &mut self.prior_low),
        };
        if !correction {
            *prior = last.take();
            self.state.previous_pivot = self.state.last_pivot;
        }
        *last = Some(*pivot);
        self.state.last_pivot = Some(*pivot);

        if let Some(prior) = prior {
            let before = self.state.direction;
            if pivot.price > prior.price {
                self.state.direction = TrendDirection::Up;
            } else if pivot.price < prior.price {
                self.state.direction = TrendDirection::Down;
            }
            if before != self.state.direction {
                debug!(
                    from = %before,
                    to = %self.state.direction,
                    kind = %pivot.kind,
                    price = pivot.price,
                    "Trend changed"
                );
            }
        }
        self.state
    }
}
