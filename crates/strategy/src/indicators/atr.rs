use common::{Bar, Error, Result};

/// Streaming ATR (Average True Range) using Wilder's smoothing.
///
/// The first value is the simple mean of the first `period` true ranges;
/// after that `atr = (atr * (period - 1) + tr) / period`.
/// Returns `None` until `period` bars have been seen.
#[derive(Debug, Clone)]
pub struct Atr {
    period: usize,
    prev_close: Option<f64>,
    seed_sum: f64,
    seen: usize,
    value: Option<f64>,
}

impl Atr {
    pub fn new(period: usize) -> Result<Self> {
        if period < 1 {
            return Err(Error::Config("ATR period must be >= 1".into()));
        }
        Ok(Self {
            period,
            prev_close: None,
            seed_sum: 0.0,
            seen: 0,
            value: None,
        })
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Add one finished bar and return the current ATR.
    pub fn update(&mut self, bar: &Bar) -> Option<f64> {
        let tr = match self.prev_close {
            Some(pc) => (bar.high - bar.low)
                .max((bar.high - pc).abs())
                .max((bar.low - pc).abs()),
            None => bar.high - bar.low,
        };
        self.prev_close = Some(bar.close);
        self.seen += 1;

        let n = self.period as f64;
        self.value = match self.value {
            Some(prev) => Some((prev * (n - 1.0) + tr) / n),
            None => {
                self.seed_sum += tr;
                (self.seen >= self.period).then(|| self.seed_sum / n)
            }
        };
        self.value
    }
}
