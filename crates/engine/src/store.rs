use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use common::{Error, Result};
use risk::RiskSnapshot;

/// SQLite-backed persistence of risk snapshots, one row per instrument.
#[derive(Clone)]
pub struct SnapshotStore {
    db: SqlitePool,
}

impl SnapshotStore {
    /// Open (creating if needed) the database at `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // A single connection keeps `sqlite::memory:` databases shared.
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::migrate!("../../migrations")
            .run(&db)
            .await
            .map_err(sqlx::Error::from)?;
        info!("Snapshot store ready");
        Ok(Self { db })
    }

    pub async fn save(&self, snapshot: &RiskSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO risk_snapshots (
                instrument, state, side, volume, entry_price, open_time,
                stop_price, take_price, trailing_anchor,
                break_even_applied, trailing_armed, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(instrument) DO UPDATE SET
                state = excluded.state,
                side = excluded.side,
                volume = excluded.volume,
                entry_price = excluded.entry_price,
                open_time = excluded.open_time,
                stop_price = excluded.stop_price,
                take_price = excluded.take_price,
                trailing_anchor = excluded.trailing_anchor,
                break_even_applied = excluded.break_even_applied,
                trailing_armed = excluded.trailing_armed,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&snapshot.instrument)
        .bind(snapshot.state.to_string())
        .bind(snapshot.side.map(|s| s.to_string()))
        .bind(snapshot.volume)
        .bind(snapshot.entry_price)
        .bind(snapshot.open_time.map(|t| t.to_rfc3339()))
        .bind(snapshot.stop_price)
        .bind(snapshot.take_price)
        .bind(snapshot.trailing_anchor)
        .bind(snapshot.break_even_applied)
        .bind(snapshot.trailing_armed)
        .bind(snapshot.updated_at.to_rfc3339())
        .execute(&self.db)
        .await?;
        debug!(instrument = %snapshot.instrument, state = %snapshot.state, "Risk snapshot saved");
        Ok(())
    }

    pub async fn load(&self, instrument: &str) -> Result<Option<RiskSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT instrument, state, side, volume, entry_price, open_time,
                   stop_price, take_price, trailing_anchor,
                   break_even_applied, trailing_armed, updated_at
            FROM risk_snapshots
            WHERE instrument = ?1
            "#,
        )
        .bind(instrument)
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let side: Option<String> = row.try_get("side")?;
        let open_time: Option<String> = row.try_get("open_time")?;
        Ok(Some(RiskSnapshot {
            instrument: row.try_get("instrument")?,
            state: parse_enum(&row.try_get::<String, _>("state")?)?,
            side: side.as_deref().map(parse_enum).transpose()?,
            volume: row.try_get("volume")?,
            entry_price: row.try_get("entry_price")?,
            open_time: open_time.as_deref().map(parse_time).transpose()?,
            stop_price: row.try_get("stop_price")?,
            take_price: row.try_get("take_price")?,
            trailing_anchor: row.try_get("trailing_anchor")?,
            break_even_applied: row.try_get("break_even_applied")?,
            trailing_armed: row.try_get("trailing_armed")?,
            updated_at: parse_time(&row.try_get::<String, _>("updated_at")?)?,
        }))
    }

    pub async fn delete(&self, instrument: &str) -> Result<()> {
        sqlx::query("DELETE FROM risk_snapshots WHERE instrument = ?1")
            .bind(instrument)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

/// Enums are stored by their serde names.
fn parse_enum<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(raw.to_string()))?)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("bad timestamp '{raw}' in snapshot store: {e}")))
}
