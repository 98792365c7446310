//! SQLite store: stations, programs, options and the run log.
//!
//! Queries are built at runtime (`sqlx::query`), so the crate compiles
//! without a database at hand.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use tracing::warn;

use crate::events::Event;
use crate::options::{Options, RUNTIME_KEYS};
use crate::program::Program;
use crate::queue::RunSource;
use crate::station::{SpecialType, StationAttributes, StationRecord};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One finished watering.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RunRecord {
    pub ts_start: i64,
    pub ts_end: i64,
    pub station: i64,
    pub program: Option<i64>,
    pub source: String,
    pub duration: i64,
    pub flow_volume: Option<f64>,
}

impl RunRecord {
    /// Run-log row for a station-off event; `None` for anything else.
    pub fn from_event(event: &Event) -> Option<Self> {
        let Event::StationOff {
            station,
            source,
            start,
            duration,
            flow_volume,
        } = event
        else {
            return None;
        };
        let (source, program) = match source {
            RunSource::Program(p) => ("program", Some(*p as i64)),
            RunSource::ManualProgram(p) => ("manual_program", Some(*p as i64)),
            RunSource::Manual => ("manual", None),
        };
        Some(Self {
            ts_start: *start,
            ts_end: start + duration,
            station: *station as i64,
            program,
            source: source.to_string(),
            duration: *duration,
            flow_volume: *flow_volume,
        })
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/sprinkler/sprinkler.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // every connection to :memory: is its own database
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Stations
    // ----------------------------

    pub async fn upsert_station(&self, s: &StationRecord) -> Result<()> {
        let attributes = serde_json::to_string(&s.attributes).context("failed to encode station attributes")?;
        sqlx::query(
            r#"
            INSERT INTO stations (id, name, attributes, special_type, payload)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              attributes=excluded.attributes,
              special_type=excluded.special_type,
              payload=excluded.payload
            "#,
        )
        .bind(s.id as i64)
        .bind(&s.name)
        .bind(attributes)
        .bind(s.special_type.as_str())
        .bind(&s.payload)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert_station failed for station {}", s.id))?;
        Ok(())
    }

    /// Undecodable attributes or an unknown special type fall back to the
    /// defaults with a warning.
    pub async fn load_stations(&self) -> Result<Vec<StationRecord>> {
        let rows = sqlx::query("SELECT id, name, attributes, special_type, payload FROM stations ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("load_stations failed")?;

        let mut stations = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let Ok(id) = usize::try_from(id) else {
                warn!(id, "db: negative station id skipped");
                continue;
            };
            let raw_attributes: String = row.try_get("attributes")?;
            let attributes = serde_json::from_str::<StationAttributes>(&raw_attributes).unwrap_or_else(|e| {
                warn!(station = id, "db: bad station attributes, using defaults: {e}");
                StationAttributes::default()
            });
            let raw_type: String = row.try_get("special_type")?;
            let special_type = SpecialType::parse(&raw_type).unwrap_or_else(|| {
                warn!(station = id, special_type = %raw_type, "db: unknown special type, treated as standard");
                SpecialType::Standard
            });
            stations.push(StationRecord {
                id,
                name: row.try_get("name")?,
                attributes,
                special_type,
                payload: row.try_get("payload")?,
            });
        }
        Ok(stations)
    }

    // ----------------------------
    // Programs
    // ----------------------------

    /// Replace the whole program list; row id is the program index.
    pub async fn replace_programs(&self, programs: &[Program]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("replace_programs: begin failed")?;
        sqlx::query("DELETE FROM programs")
            .execute(&mut *tx)
            .await
            .context("replace_programs: delete failed")?;
        for (index, program) in programs.iter().enumerate() {
            let body = serde_json::to_string(program)
                .with_context(|| format!("failed to encode program '{}'", program.name))?;
            sqlx::query("INSERT INTO programs (id, body) VALUES (?, ?)")
                .bind(index as i64)
                .bind(body)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("replace_programs: insert failed for '{}'", program.name))?;
        }
        tx.commit().await.context("replace_programs: commit failed")?;
        Ok(())
    }

    pub async fn load_programs(&self) -> Result<Vec<Program>> {
        let rows = sqlx::query("SELECT id, body FROM programs ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("load_programs failed")?;

        rows.into_iter()
            .map(|row| {
                let id: i64 = row.try_get("id")?;
                let body: String = row.try_get("body")?;
                serde_json::from_str(&body).with_context(|| format!("stored program {id} does not decode"))
            })
            .collect()
    }

    // ----------------------------
    // Options
    // ----------------------------

    /// Write every option from the config file. Runtime-owned keys are only
    /// inserted when absent.
    pub async fn seed_options(&self, options: &Options) -> Result<()> {
        for (key, value) in options.to_pairs() {
            let sql = if RUNTIME_KEYS.contains(&key.as_str()) {
                "INSERT OR IGNORE INTO options (key, value) VALUES (?, ?)"
            } else {
                "INSERT INTO options (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value"
            };
            sqlx::query(sql)
                .bind(&key)
                .bind(value.to_string())
                .execute(&self.pool)
                .await
                .with_context(|| format!("seed_options failed for key '{key}'"))?;
        }
        Ok(())
    }

    /// Persist the options the controller changes at runtime.
    pub async fn save_runtime_options(&self, options: &Options) -> Result<()> {
        for (key, value) in options.to_pairs() {
            if !RUNTIME_KEYS.contains(&key.as_str()) {
                continue;
            }
            sqlx::query(
                "INSERT INTO options (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            )
            .bind(&key)
            .bind(value.to_string())
            .execute(&self.pool)
            .await
            .with_context(|| format!("save_runtime_options failed for key '{key}'"))?;
        }
        Ok(())
    }

    /// Stored options overlaid on `base`; bad rows keep the base value.
    pub async fn load_options(&self, base: &Options) -> Result<Options> {
        let rows = sqlx::query("SELECT key, value FROM options")
            .fetch_all(&self.pool)
            .await
            .context("load_options failed")?;

        let mut pairs = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let raw: String = row.try_get("value")?;
            match serde_json::from_str(&raw) {
                Ok(value) => pairs.push((key, value)),
                Err(e) => warn!(key = %key, "db: option value is not json, ignored: {e}"),
            }
        }
        Ok(Options::from_pairs(base, pairs))
    }

    // ----------------------------
    // Run log
    // ----------------------------

    pub async fn insert_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_log (ts_start, ts_end, station, program, source, duration, flow_volume)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.ts_start)
        .bind(run.ts_end)
        .bind(run.station)
        .bind(run.program)
        .bind(&run.source)
        .bind(run.duration)
        .bind(run.flow_volume)
        .execute(&self.pool)
        .await
        .context("insert_run failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunRecord>> {
        sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT ts_start, ts_end, station, program, source, duration, flow_volume
            FROM run_log
            ORDER BY ts_start DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_runs failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
