use std::time::Duration;

use tokio::sync::mpsc;

use crate::{Bar, Result};

/// Delivers the ordered bar stream of one (instrument, timeframe).
///
/// Timestamps are non-decreasing; partial bars may be interleaved and are
/// skipped by consumers.
pub trait CandleSource: Send + Sync {
    fn subscribe(&self, instrument: &str, timeframe: Duration) -> Result<mpsc::Receiver<Bar>>;
}
