use thiserror::Error;

use crate::OrderId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data gap on {instrument}: {detail}")]
    DataGap { instrument: String, detail: String },

    #[error("Order rejected: {reason}")]
    OrderRejected { reason: String },

    #[error("Order {0} already filled")]
    AlreadyFilled(OrderId),

    #[error("Unknown order {0}")]
    UnknownOrder(OrderId),

    #[error("Reconciliation mismatch on {instrument}: {detail}")]
    ReconciliationMismatch { instrument: String, detail: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
