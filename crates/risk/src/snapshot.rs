use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{Error, Position, ProtectiveLevels, Result, RiskState, Side};

/// Flat, persistable record of a manager's state. One row per instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub instrument: String,
    pub state: RiskState,
    pub side: Option<Side>,
    pub volume: Option<f64>,
    pub entry_price: Option<f64>,
    pub open_time: Option<DateTime<Utc>>,
    pub stop_price: Option<f64>,
    pub take_price: Option<f64>,
    pub trailing_anchor: Option<f64>,
    pub break_even_applied: bool,
    pub trailing_armed: bool,
    pub updated_at: DateTime<Utc>,
}

impl RiskSnapshot {
    pub fn capture(
        instrument: &str,
        state: RiskState,
        position: Option<&Position>,
        levels: &ProtectiveLevels,
    ) -> Self {
        Self {
            instrument: instrument.to_string(),
            state,
            side: position.map(|p| p.side),
            volume: position.map(|p| p.volume),
            entry_price: position.map(|p| p.entry_price),
            open_time: position.map(|p| p.open_time),
            stop_price: levels.stop_price,
            take_price: levels.take_price,
            trailing_anchor: levels.trailing_anchor,
            break_even_applied: levels.break_even_applied,
            trailing_armed: levels.trailing_armed,
            updated_at: Utc::now(),
        }
    }

    /// The open position, if the snapshot holds a complete one.
    pub fn position(&self) -> Result<Option<Position>> {
        match (self.side, self.volume, self.entry_price, self.open_time) {
            (None, None, None, None) => Ok(None),
            (Some(side), Some(volume), Some(entry_price), Some(open_time)) => Ok(Some(Position {
                side,
                volume,
                entry_price,
                open_time,
            })),
            _ => Err(Error::Other(format!(
                "snapshot for {} holds a partial position",
                self.instrument
            ))),
        }
    }

    pub fn levels(&self) -> ProtectiveLevels {
        ProtectiveLevels {
            stop_price: self.stop_price,
            take_price: self.take_price,
            trailing_anchor: self.trailing_anchor,
            break_even_applied: self.break_even_applied,
            trailing_armed: self.trailing_armed,
        }
    }
}
