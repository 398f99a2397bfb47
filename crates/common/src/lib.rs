pub mod config;
pub mod error;
pub mod gateway;
pub mod source;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use gateway::OrderGateway;
pub use source::CandleSource;
pub use types::*;
