use tokio::sync::watch;

use common::{TrendDirection, TrendState};

/// Create a single-writer trend cell.
///
/// The publisher is not `Clone`, so exactly one pipeline owns the write side;
/// any number of readers may observe the latest value without waiting.
pub fn trend_cell() -> (TrendPublisher, TrendReader) {
    let (tx, rx) = watch::channel(TrendState::default());
    (TrendPublisher { tx }, TrendReader { rx })
}

pub struct TrendPublisher {
    tx: watch::Sender<TrendState>,
}

impl TrendPublisher {
    /// Replace the published state. Succeeds with or without live readers.
    pub fn publish(&self, state: TrendState) {
        self.tx.send_replace(state);
    }

    pub fn reader(&self) -> TrendReader {
        TrendReader {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Clone)]
pub struct TrendReader {
    rx: watch::Receiver<TrendState>,
}

impl TrendReader {
    pub fn current(&self) -> TrendState {
        *self.rx.borrow()
    }

    pub fn direction(&self) -> TrendDirection {
        self.rx.borrow().direction
    }
}
