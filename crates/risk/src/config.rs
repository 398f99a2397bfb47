use serde::{Deserialize, Serialize};

use common::{Error, Pivot, Result, Side};

/// How the initial stop and target are placed when a position opens.
/// Exactly one policy is active per stream.
///
/// ```toml
/// [pipeline.risk.policy]
/// type = "atr_multiple"
/// stop_multiple = 2.0
/// take_multiple = 3.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopPolicy {
    /// Fixed distances expressed in price steps (ticks).
    FixedSteps {
        price_step: f64,
        #[serde(default)]
        stop_steps: Option<f64>,
        #[serde(default)]
        take_steps: Option<f64>,
    },
    /// Distances as multiples of the current ATR.
    AtrMultiple {
        stop_multiple: f64,
        #[serde(default)]
        take_multiple: Option<f64>,
    },
    /// Stop just beyond the nearest opposing swing; target at a multiple of
    /// the resulting risk.
    Pivot {
        buffer: f64,
        #[serde(default)]
        reward_ratio: Option<f64>,
    },
}

/// Inputs a policy may need besides the entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyInputs {
    pub atr: Option<f64>,
    pub last_high: Option<Pivot>,
    pub last_low: Option<Pivot>,
}

impl StopPolicy {
    /// Compute `(stop, take)` for a fresh position. Either may be `None` when
    /// the policy leaves it unset or lacks the data to compute it.
    pub fn initial_levels(
        &self,
        side: Side,
        entry: f64,
        inputs: &PolicyInputs,
    ) -> (Option<f64>, Option<f64>) {
        let sign = side.sign();
        match *self {
            StopPolicy::FixedSteps {
                price_step,
                stop_steps,
                take_steps,
            } => (
                stop_steps.map(|n| entry - sign * n * price_step),
                take_steps.map(|n| entry + sign * n * price_step),
            ),
            StopPolicy::AtrMultiple {
                stop_multiple,
                take_multiple,
            } => match inputs.atr {
                Some(atr) if atr > 0.0 => (
                    Some(entry - sign * stop_multiple * atr),
                    take_multiple.map(|m| entry + sign * m * atr),
                ),
                _ => (None, None),
            },
            StopPolicy::Pivot {
                buffer,
                reward_ratio,
            } => {
                let opposing = match side {
                    Side::Long => inputs.last_low,
                    Side::Short => inputs.last_high,
                };
                let Some(pivot) = opposing else {
                    return (None, None);
                };
                let stop = pivot.price - sign * buffer;
                let risk = (entry - stop) * sign;
                if risk <= 0.0 {
                    return (None, None);
                }
                (Some(stop), reward_ratio.map(|r| entry + sign * r * risk))
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            StopPolicy::FixedSteps {
                price_step,
                stop_steps,
                take_steps,
            } => {
                positive("fixed_steps.price_step", price_step)?;
                optional_positive("fixed_steps.stop_steps", stop_steps)?;
                optional_positive("fixed_steps.take_steps", take_steps)
            }
            StopPolicy::AtrMultiple {
                stop_multiple,
                take_multiple,
            } => {
                positive("atr_multiple.stop_multiple", stop_multiple)?;
                optional_positive("atr_multiple.take_multiple", take_multiple)
            }
            StopPolicy::Pivot {
                buffer,
                reward_ratio,
            } => {
                non_negative("pivot.buffer", buffer)?;
                optional_positive("pivot.reward_ratio", reward_ratio)
            }
        }
    }
}

/// Move the stop to `entry ± offset` once the trade has run `trigger`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakEvenConfig {
    pub trigger: f64,
    #[serde(default)]
    pub offset: f64,
}

/// Trail the stop `distance` behind the close once the trade has run `arm`,
/// moving it only in increments of at least `step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingConfig {
    pub arm: f64,
    pub distance: f64,
    #[serde(default)]
    pub step: f64,
}

/// Tighten the stop to `buffer` beyond each new adverse swing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotAnchorConfig {
    #[serde(default)]
    pub buffer: f64,
}

/// User-configurable protective-level parameters, all in price units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub policy: StopPolicy,
    #[serde(default)]
    pub break_even: Option<BreakEvenConfig>,
    #[serde(default)]
    pub trailing: Option<TrailingConfig>,
    #[serde(default)]
    pub pivot_anchor: Option<PivotAnchorConfig>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            policy: StopPolicy::FixedSteps {
                price_step: 1.0,
                stop_steps: None,
                take_steps: None,
            },
            break_even: None,
            trailing: None,
            pivot_anchor: None,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        if let Some(be) = &self.break_even {
            non_negative("break_even.trigger", be.trigger)?;
            finite("break_even.offset", be.offset)?;
            // At offset == trigger the stop would sit on the close.
            if be.offset >= be.trigger {
                return Err(Error::Config(format!(
                    "break_even.offset ({}) must be below break_even.trigger ({})",
                    be.offset, be.trigger
                )));
            }
        }
        if let Some(tr) = &self.trailing {
            non_negative("trailing.arm", tr.arm)?;
            positive("trailing.distance", tr.distance)?;
            non_negative("trailing.step", tr.step)?;
        }
        if let Some(pa) = &self.pivot_anchor {
            non_negative("pivot_anchor.buffer", pa.buffer)?;
        }
        Ok(())
    }
}

fn finite(name: &str, v: f64) -> Result<()> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(Error::Config(format!("{name} must be a finite number, got {v}")))
    }
}

fn non_negative(name: &str, v: f64) -> Result<()> {
    finite(name, v)?;
    if v < 0.0 {
        return Err(Error::Config(format!("{name} must not be negative, got {v}")));
    }
    Ok(())
}

fn positive(name: &str, v: f64) -> Result<()> {
    finite(name, v)?;
    if v <= 0.0 {
        return Err(Error::Config(format!("{name} must be positive, got {v}")));
    }
    Ok(())
}

fn optional_positive(name: &str, v: Option<f64>) -> Result<()> {
    v.map_or(Ok(()), |v| positive(name, v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::PivotKind;

    fn pivot(kind: PivotKind, price: f64) -> Pivot {
        Pivot {
            kind,
            price,
            bar_index: 1,
            time: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    #[test]
    fn fixed_steps_mirror_for_shorts() {
        let policy = StopPolicy::FixedSteps {
            price_step: 0.5,
            stop_steps: Some(4.0),
            take_steps: Some(8.0),
        };
        let inputs = PolicyInputs::default();
        assert_eq!(
            policy.initial_levels(Side::Long, 100.0, &inputs),
            (Some(98.0), Some(104.0))
        );
        assert_eq!(
            policy.initial_levels(Side::Short, 100.0, &inputs),
            (Some(102.0), Some(96.0))
        );
    }

    #[test]
    fn atr_policy_needs_an_atr() {
        let policy = StopPolicy::AtrMultiple {
            stop_multiple: 2.0,
            take_multiple: Some(3.0),
        };
        assert_eq!(
            policy.initial_levels(Side::Long, 100.0, &PolicyInputs::default()),
            (None, None)
        );
        let inputs = PolicyInputs {
            atr: Some(1.5),
            ..PolicyInputs::default()
        };
        assert_eq!(
            policy.initial_levels(Side::Long, 100.0, &inputs),
            (Some(97.0), Some(104.5))
        );
    }

    #[test]
    fn pivot_policy_uses_opposing_swing() {
        let policy = StopPolicy::Pivot {
            buffer: 0.5,
            reward_ratio: Some(2.0),
        };
        let inputs = PolicyInputs {
            atr: None,
            last_high: Some(pivot(PivotKind::High, 110.0)),
            last_low: Some(pivot(PivotKind::Low, 95.0)),
        };
        assert_eq!(
            policy.initial_levels(Side::Long, 100.0, &inputs),
            (Some(94.5), Some(111.0))
        );
        assert_eq!(
            policy.initial_levels(Side::Short, 100.0, &inputs),
            (Some(110.5), Some(79.0))
        );
    }

    #[test]
    fn pivot_on_wrong_side_of_entry_leaves_levels_unset() {
        let policy = StopPolicy::Pivot {
            buffer: 0.0,
            reward_ratio: None,
        };
        let inputs = PolicyInputs {
            last_low: Some(pivot(PivotKind::Low, 101.0)),
            ..PolicyInputs::default()
        };
        assert_eq!(
            policy.initial_levels(Side::Long, 100.0, &inputs),
            (None, None)
        );
    }

    #[test]
    fn negative_distances_are_rejected() {
        let cfg = RiskConfig {
            trailing: Some(TrailingConfig {
                arm: 1.0,
                distance: -1.0,
                step: 0.0,
            }),
            ..RiskConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let cfg = RiskConfig {
            policy: StopPolicy::Pivot {
                buffer: -0.1,
                reward_ratio: None,
            },
            ..RiskConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn break_even_offset_must_stay_below_trigger() {
        let with = |trigger, offset| RiskConfig {
            break_even: Some(BreakEvenConfig { trigger, offset }),
            ..RiskConfig::default()
        };
        assert!(matches!(with(4.0, 4.0).validate(), Err(Error::Config(_))));
        assert!(matches!(with(0.0, 0.0).validate(), Err(Error::Config(_))));
        assert!(with(4.0, 3.5).validate().is_ok());
        assert!(with(4.0, -1.0).validate().is_ok());
    }

    #[test]
    fn parses_from_toml() {
        let cfg: RiskConfig = toml::from_str(
            r#"
            [policy]
            type = "pivot"
            buffer = 0.25
            reward_ratio = 2.0

            [trailing]
            arm = 5.0
            distance = 3.0
            step = 1.0
            "#,
        )
        .unwrap();
        assert!(matches!(cfg.policy, StopPolicy::Pivot { .. }));
        assert_eq!(cfg.trailing.as_ref().unwrap().distance, 3.0);
        assert!(cfg.break_even.is_none());
        assert!(cfg.validate().is_ok());
    }
}
