use crate::{Error, Result};

/// Process-level configuration loaded from environment variables at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path of the TOML file describing the pipelines.
    pub strategy_config_path: String,

    /// SQLite URL for risk snapshots. `None` disables persistence.
    pub database_url: Option<String>,

    // Paper gateway
    pub paper_slippage_bps: f64,
    /// Reject every n-th protective order submission (fault injection).
    pub paper_reject_every: Option<u32>,
}

impl Config {
    /// Load configuration from the environment, reading `.env` if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let paper_slippage_bps = match lookup("PAPER_SLIPPAGE_BPS") {
            Some(raw) => {
                let bps: f64 = raw.trim().parse().map_err(|_| {
                    Error::Config(format!("PAPER_SLIPPAGE_BPS must be a number, got '{raw}'"))
                })?;
                if bps < 0.0 {
                    return Err(Error::Config(format!(
                        "PAPER_SLIPPAGE_BPS must not be negative, got {bps}"
                    )));
                }
                bps
            }
            None => 0.0,
        };

        let paper_reject_every = match lookup("PAPER_REJECT_EVERY") {
            Some(raw) => {
                let n: u32 = raw.trim().parse().map_err(|_| {
                    Error::Config(format!("PAPER_REJECT_EVERY must be an integer, got '{raw}'"))
                })?;
                (n > 0).then_some(n)
            }
            None => None,
        };

        Ok(Config {
            strategy_config_path: lookup("STRATEGY_CONFIG_PATH")
                .unwrap_or_else(|| "config/strategies.toml".to_string()),
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            paper_slippage_bps,
            paper_reject_every,
        })
    }
}
