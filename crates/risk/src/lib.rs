//! Protective-level state machine for one open position per instrument:
//! initial stop/target placement, break-even, trailing and swing-anchored
//! stops, and fill reconciliation.

pub mod config;
pub mod manager;
pub mod snapshot;

pub use config::{BreakEvenConfig, PivotAnchorConfig, PolicyInputs, RiskConfig, StopPolicy, TrailingConfig};
pub use manager::{FillOutcome, PositionRiskManager};
pub use snapshot::RiskSnapshot;
