use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use common::{Error, Result};

/// Swing detection parameters.
///
/// ```toml
/// [pipeline.pivot]
/// depth = 12
/// deviation = 0.5
/// backstep = 3
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PivotConfig {
    /// Number of bars in the rolling extremum window. Must be >= 2.
    pub depth: usize,
    /// Minimum improvement for a same-kind pivot to replace the last one.
    #[serde(default)]
    pub deviation: f64,
    /// Minimum number of bars between opposite-kind pivots.
    #[serde(default)]
    pub backstep: u64,
    /// Maximum number of pivots retained in history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    512
}

impl Default for PivotConfig {
    fn default() -> Self {
        Self {
            depth: 12,
            deviation: 0.0,
            backstep: 3,
            history_limit: default_history_limit(),
        }
    }
}

impl PivotConfig {
    pub fn new(depth: usize, deviation: f64, backstep: u64) -> Self {
        Self {
            depth,
            deviation,
            backstep,
            history_limit: default_history_limit(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.depth < 2 {
            return Err(Error::Config(format!(
                "pivot depth must be >= 2, got {}",
                self.depth
            )));
        }
        if !self.deviation.is_finite() || self.deviation < 0.0 {
            return Err(Error::Config(format!(
                "pivot deviation must be a non-negative number, got {}",
                self.deviation
            )));
        }
        if self.history_limit < 2 {
            return Err(Error::Config(format!(
                "pivot history_limit must be >= 2, got {}",
                self.history_limit
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AtrConfig {
    pub period: usize,
}

impl Default for AtrConfig {
    fn default() -> Self {
        Self { period: 14 }
    }
}

/// Entry-signal selection.
///
/// ```toml
/// [pipeline.signal]
/// type = "pivot_breakout"
///
/// [pipeline.signal.params]
/// threshold = 0.5
/// allow_short = false
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignalConfig {
    /// Evaluator type identifier: "trend_flip" or "pivot_breakout".
    #[serde(rename = "type")]
    pub signal_type: String,
    /// Evaluator-specific parameters.
    #[serde(default)]
    pub params: HashMap<String, toml::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_below_two_is_rejected() {
        let err = PivotConfig::new(1, 0.0, 0).validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn negative_deviation_is_rejected() {
        let err = PivotConfig::new(5, -0.1, 0).validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn pivot_config_parses_with_defaults() {
        let cfg: PivotConfig = toml::from_str("depth = 5").unwrap();
        assert_eq!(cfg.depth, 5);
        assert_eq!(cfg.deviation, 0.0);
        assert_eq!(cfg.backstep, 0);
        assert_eq!(cfg.history_limit, 512);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn signal_config_keeps_params() {
        let cfg: SignalConfig = toml::from_str(
            r#"
            type = "pivot_breakout"
            [params]
            threshold = 0.25
            "#,
        )
        .unwrap();
        assert_eq!(cfg.signal_type, "pivot_breakout");
        assert_eq!(cfg.params["threshold"].as_float(), Some(0.25));
    }
}
