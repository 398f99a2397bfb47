use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use common::{Error, Result};
use risk::RiskConfig;
use strategy::{AtrConfig, PivotConfig, SignalConfig};

/// Top-level shape of the strategy TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineFileConfig {
    #[serde(rename = "pipeline", default)]
    pub pipelines: Vec<PipelineConfig>,
}

/// One (instrument, timeframe) stream.
///
/// ```toml
/// [[pipeline]]
/// name = "btc-1h"
/// instrument = "BTCUSDT"
/// timeframe_secs = 3600
/// volume = 0.01
/// bars_path = "data/btc_1h.jsonl"
/// higher_timeframe = "btc-4h"
///
/// [pipeline.pivot]
/// depth = 5
///
/// [pipeline.signal]
/// type = "trend_flip"
///
/// [pipeline.risk.policy]
/// type = "fixed_steps"
/// price_step = 0.5
/// stop_steps = 40
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub instrument: String,
    pub timeframe_secs: u64,
    /// Order volume for entries.
    #[serde(default)]
    pub volume: f64,
    /// JSON-lines bar file replayed into this pipeline.
    #[serde(default)]
    pub bars_path: Option<String>,
    /// Publish this pipeline's trend for other pipelines to read.
    #[serde(default)]
    pub publish_trend: bool,
    /// Name of a publishing pipeline whose trend gates entries.
    #[serde(default)]
    pub higher_timeframe: Option<String>,
    /// Bars further apart than this many timeframes are a data gap.
    #[serde(default)]
    pub max_gap_bars: Option<u32>,
    #[serde(default)]
    pub pivot: PivotConfig,
    #[serde(default)]
    pub atr: AtrConfig,
    /// Entry rule. Without one the pipeline only tracks structure.
    #[serde(default)]
    pub signal: Option<SignalConfig>,
    #[serde(default)]
    pub risk: RiskConfig,
}

impl PipelineConfig {
    pub fn timeframe(&self) -> Duration {
        Duration::from_secs(self.timeframe_secs)
    }

    /// Largest accepted distance between consecutive bar open times.
    pub fn max_interval(&self) -> Option<chrono::Duration> {
        self.max_gap_bars
            .map(|n| chrono::Duration::seconds(self.timeframe_secs as i64 * n as i64))
    }
}

impl PipelineFileConfig {
    /// Load and validate the strategy file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read strategy config '{}': {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let cfg: PipelineFileConfig = toml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut trading = HashSet::new();
        for p in &self.pipelines {
            if !names.insert(p.name.as_str()) {
                return Err(Error::Config(format!("duplicate pipeline name '{}'", p.name)));
            }
            if p.timeframe_secs == 0 {
                return Err(Error::Config(format!(
                    "pipeline '{}': timeframe_secs must be positive",
                    p.name
                )));
            }
            if p.signal.is_some() && !(p.volume.is_finite() && p.volume > 0.0) {
                return Err(Error::Config(format!(
                    "pipeline '{}': volume must be positive, got {}",
                    p.name, p.volume
                )));
            }
            if p.signal.is_some() && !trading.insert(p.instrument.as_str()) {
                return Err(Error::Config(format!(
                    "pipeline '{}': instrument {} already has a trading pipeline",
                    p.name, p.instrument
                )));
            }
            p.pivot.validate()?;
            p.risk.validate()?;
        }
        for p in &self.pipelines {
            let Some(higher) = &p.higher_timeframe else { continue };
            let Some(source) = self.pipelines.iter().find(|q| &q.name == higher) else {
                return Err(Error::Config(format!(
                    "pipeline '{}': higher_timeframe '{higher}' does not exist",
                    p.name
                )));
            };
            if !source.publish_trend {
                return Err(Error::Config(format!(
                    "pipeline '{}': higher_timeframe '{higher}' does not publish its trend",
                    p.name
                )));
            }
            if source.name == p.name {
                return Err(Error::Config(format!(
                    "pipeline '{}' cannot gate itself",
                    p.name
                )));
            }
        }
        Ok(())
    }
}
