use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One OHLCV candle for a single (instrument, timeframe) stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// True once the candle has closed. Only final bars drive pivots and risk.
    #[serde(default = "default_final")]
    pub is_final: bool,
}

fn default_final() -> bool {
    true
}

impl Bar {
    pub fn new(open_time: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume: 0.0,
            is_final: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PivotKind {
    High,
    Low,
}

impl PivotKind {
    pub fn opposite(self) -> Self {
        match self {
            PivotKind::High => PivotKind::Low,
            PivotKind::Low => PivotKind::High,
        }
    }
}

impl std::fmt::Display for PivotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PivotKind::High => write!(f, "high"),
            PivotKind::Low => write!(f, "low"),
        }
    }
}

/// A confirmed swing point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pivot {
    pub kind: PivotKind,
    pub price: f64,
    /// Zero-based index of the bar within its stream.
    pub bar_index: u64,
    pub time: DateTime<Utc>,
}

/// What a detector reports for a bar that moved the pivot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PivotUpdate {
    /// A new pivot was appended; its kind differs from the previous one.
    Confirmed(Pivot),
    /// The last pivot was corrected by a better same-kind extreme.
    Replaced { previous: Pivot, current: Pivot },
}

impl PivotUpdate {
    /// The pivot that is now last in the sequence.
    pub fn pivot(&self) -> &Pivot {
        match self {
            PivotUpdate::Confirmed(p) => p,
            PivotUpdate::Replaced { current, .. } => current,
        }
    }

    pub fn is_replacement(&self) -> bool {
        matches!(self, PivotUpdate::Replaced { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    #[default]
    Flat,
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrendDirection::Up => write!(f, "up"),
            TrendDirection::Down => write!(f, "down"),
            TrendDirection::Flat => write!(f, "flat"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrendState {
    pub direction: TrendDirection,
    pub last_pivot: Option<Pivot>,
    pub previous_pivot: Option<Pivot>,
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens a position in this direction.
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces or closes a position in this direction.
    pub fn exit_order_side(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    /// +1 for longs, -1 for shorts. Multiplying a price move by this gives
    /// the move in the position's favour.
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Side of an order sent to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Position direction an order of this side opens from flat.
    pub fn opens(self) -> Side {
        match self {
            OrderSide::Buy => Side::Long,
            OrderSide::Sell => Side::Short,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Stop,
    Limit,
}

/// Gateway-assigned order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl OrderId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An order as accepted by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub instrument: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub volume: f64,
    /// Trigger price for stops, limit price for limits, `None` for market.
    pub price: Option<f64>,
}

impl Order {
    pub fn market(instrument: impl Into<String>, side: OrderSide, volume: f64) -> Self {
        Self {
            id: OrderId::generate(),
            instrument: instrument.into(),
            side,
            kind: OrderKind::Market,
            volume,
            price: None,
        }
    }

    pub fn stop(instrument: impl Into<String>, side: OrderSide, volume: f64, price: f64) -> Self {
        Self {
            id: OrderId::generate(),
            instrument: instrument.into(),
            side,
            kind: OrderKind::Stop,
            volume,
            price: Some(price),
        }
    }

    pub fn limit(instrument: impl Into<String>, side: OrderSide, volume: f64, price: f64) -> Self {
        Self {
            id: OrderId::generate(),
            instrument: instrument.into(),
            side,
            kind: OrderKind::Limit,
            volume,
            price: Some(price),
        }
    }
}

/// Execution report delivered asynchronously by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    /// Unique per execution; duplicates of the same report share it.
    pub fill_id: String,
    pub order_id: OrderId,
    pub instrument: String,
    pub side: OrderSide,
    pub price: f64,
    pub volume: f64,
    pub time: DateTime<Utc>,
}

/// The single open position of an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub volume: f64,
    pub entry_price: f64,
    pub open_time: DateTime<Utc>,
}

/// Stop/target state attached 1:1 to an open position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveLevels {
    pub stop_price: Option<f64>,
    pub take_price: Option<f64>,
    /// Most favourable close seen since entry.
    pub trailing_anchor: Option<f64>,
    pub break_even_applied: bool,
    pub trailing_armed: bool,
}

impl ProtectiveLevels {
    pub fn is_cleared(&self) -> bool {
        *self == ProtectiveLevels::default()
    }
}

/// Lifecycle of the position owned by a risk manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskState {
    #[default]
    Flat,
    /// Position open, protective stop not (yet) live.
    Unprotected,
    Protected,
    /// A market exit was sent; waiting for its fill.
    ExitRequested,
    /// Fills disagreed with the tracked position. Nothing is managed until
    /// the host resolves it.
    Frozen,
}

impl std::fmt::Display for RiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskState::Flat => write!(f, "flat"),
            RiskState::Unprotected => write!(f, "unprotected"),
            RiskState::Protected => write!(f, "protected"),
            RiskState::ExitRequested => write!(f, "exit_requested"),
            RiskState::Frozen => write!(f, "frozen"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop-loss"),
            ExitReason::TakeProfit => write!(f, "take-profit"),
        }
    }
}

/// What the risk manager wants done after a bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RiskAction {
    None,
    ExitAtMarket { reason: ExitReason, level: f64 },
    RatchetStop(f64),
}

/// Which leg of the order flow the gateway rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectedLeg {
    Protective,
    Exit,
}

/// Signal emitted by an evaluator for a flat stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub side: Side,
    pub volume: f64,
}

/// Whether the engine admits new entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Stopped,
    Running,
    /// Risk management continues, new entries are suppressed.
    Paused,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Running => write!(f, "running"),
            EngineState::Paused => write!(f, "paused"),
        }
    }
}

/// Commands sent to the engine via the command channel.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Start,
    Stop,
    Pause,
    Resume,
}

/// Events surfaced by pipelines to the host.
#[derive(Debug, Clone)]
pub enum RiskEvent {
    PositionOpened {
        instrument: String,
        side: Side,
        entry_price: f64,
    },
    ExitTriggered {
        instrument: String,
        reason: ExitReason,
        level: f64,
    },
    StopMoved {
        instrument: String,
        stop_price: f64,
    },
    PositionClosed {
        instrument: String,
    },
    OrderFailed {
        instrument: String,
        error: String,
    },
    Frozen {
        instrument: String,
        detail: String,
    },
    DataGap {
        instrument: String,
        detail: String,
    },
}
