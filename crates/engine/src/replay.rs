use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use common::{Bar, CandleSource, Error, Result};

/// Candle source that replays bars from JSON-lines files, one `Bar` per line.
#[derive(Default)]
pub struct ReplaySource {
    files: HashMap<(String, Duration), PathBuf>,
    /// Delay between bars; zero replays as fast as the consumer allows.
    pace: Duration,
}

impl ReplaySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    /// Register the file backing one (instrument, timeframe) stream.
    pub fn add(&mut self, instrument: &str, timeframe: Duration, path: impl Into<PathBuf>) {
        self.files
            .insert((instrument.to_string(), timeframe), path.into());
    }

    /// Read and parse a bar file. Blank lines are skipped.
    pub fn read_bars(path: &Path) -> Result<Vec<Bar>> {
        let content = std::fs::read_to_string(path)?;
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str::<Bar>(line).map_err(|e| {
                    Error::Other(format!("{}:{}: invalid bar: {e}", path.display(), n + 1))
                })
            })
            .collect()
    }
}

impl CandleSource for ReplaySource {
    fn subscribe(&self, instrument: &str, timeframe: Duration) -> Result<mpsc::Receiver<Bar>> {
        let path = self
            .files
            .get(&(instrument.to_string(), timeframe))
            .ok_or_else(|| {
                Error::Config(format!(
                    "no bar file registered for {instrument} at {}s",
                    timeframe.as_secs()
                ))
            })?;
        let bars = Self::read_bars(path)?;
        info!(
            instrument,
            timeframe_secs = timeframe.as_secs(),
            bars = bars.len(),
            path = %path.display(),
            "Replaying bars"
        );

        let (tx, rx) = mpsc::channel(256);
        let pace = self.pace;
        let instrument = instrument.to_string();
        tokio::spawn(async move {
            for bar in bars {
                if tx.send(bar).await.is_err() {
                    debug!(instrument = %instrument, "Replay consumer dropped");
                    return;
                }
                if !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
            }
            debug!(instrument = %instrument, "Replay finished");
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{name}", uuid::Uuid::new_v4()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    const BARS: &str = r#"{"open_time":"2024-01-01T00:00:00Z","open":1.0,"high":2.0,"low":0.5,"close":1.5,"volume":10.0}

{"open_time":"2024-01-01T01:00:00Z","open":1.5,"high":2.5,"low":1.0,"close":2.0,"volume":12.0,"is_final":false}
"#;

    #[tokio::test]
    async fn replays_bars_in_file_order() {
        let path = temp_file("bars.jsonl", BARS);
        let mut source = ReplaySource::new();
        source.add("ETHUSDT", Duration::from_secs(3600), &path);

        let mut rx = source
            .subscribe("ETHUSDT", Duration::from_secs(3600))
            .unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.close, 1.5);
        assert!(first.is_final);
        assert!(!second.is_final);
        assert!(rx.recv().await.is_none());
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn unregistered_stream_is_a_config_error() {
        let source = ReplaySource::new();
        let err = source
            .subscribe("ETHUSDT", Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn bad_line_reports_its_position() {
        let path = temp_file("bad.jsonl", "{\"open_time\":\"nope\"}\n");
        let err = ReplaySource::read_bars(&path).unwrap_err();
        assert!(err.to_string().contains(":1:"));
        std::fs::remove_file(path).ok();
    }
}
