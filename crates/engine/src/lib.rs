pub mod cell;
pub mod config;
pub mod lifecycle;
pub mod pipeline;
pub mod protection;
pub mod replay;
pub mod store;

pub use cell::{trend_cell, TrendPublisher, TrendReader};
pub use config::{PipelineConfig, PipelineFileConfig};
pub use lifecycle::{Engine, EngineHandle};
pub use pipeline::Pipeline;
pub use protection::{ActiveOrder, ProtectiveSlot, StopReplace};
pub use replay::ReplaySource;
pub use store::SnapshotStore;
