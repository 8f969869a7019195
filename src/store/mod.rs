//! SQLite persistence for prediction logs, evaluation history, model metadata,
//! the default-model pointer and macro features.
//!
//! Every call opens its own connection and closes it on return; nothing holds
//! a transaction across the retrain and promote steps.

pub mod default_model;
pub mod macro_features;
pub mod model_eval;
pub mod model_meta;
pub mod prediction_log;
pub mod raw;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

pub use raw::{RawTable, RawValue};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS prediction_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER,
    created_at TEXT NOT NULL,
    model_path TEXT,
    status TEXT,
    error_message TEXT,
    predicted_volatility REAL,
    actual_volatility REAL,
    abs_error REAL,
    sector TEXT,
    time_window TEXT,
    size_category TEXT,
    comment TEXT,
    rci REAL,
    atr REAL,
    vix REAL,
    volume_rate REAL,
    cpi_delta REAL,
    us10y_yield REAL,
    btc_return REAL,
    gold_volatility REAL
);
CREATE INDEX IF NOT EXISTS ix_prediction_logs_model_path ON prediction_logs(model_path);
CREATE INDEX IF NOT EXISTS ix_prediction_logs_created_at ON prediction_logs(created_at);

CREATE TABLE IF NOT EXISTS model_eval (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT,
    model_path TEXT NOT NULL,
    ran_at TEXT NOT NULL,
    metric_mae REAL,
    n_samples INTEGER,
    triggered_by TEXT,
    note TEXT,
    new_model_path TEXT,
    new_model_digest TEXT,
    promoted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS ix_model_eval_ran_at ON model_eval(ran_at);

CREATE TABLE IF NOT EXISTS model_meta (
    model_path TEXT PRIMARY KEY,
    display_name TEXT,
    version TEXT,
    owner TEXT,
    description TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    pinned INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS default_model (
    slot INTEGER PRIMARY KEY CHECK (slot = 1),
    model_path TEXT NOT NULL,
    digest TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS macro_features (
    date TEXT PRIMARY KEY,
    vix REAL,
    us10y_yield REAL,
    gold_change REAL,
    dxy REAL,
    cpi_yoy REAL
);
"#;

#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh connection with the schema in place.
    pub fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)
            .context("failed to apply schema")?;
        Ok(conn)
    }

    pub fn init(&self) -> Result<()> {
        self.open().map(|_| ())
    }
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

/// Quote a column name for interpolation. Only plain identifiers are accepted.
pub(crate) fn quote_ident(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        bail!("invalid column name '{}'", name);
    }
    Ok(format!("\"{}\"", name))
}

pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let sql = format!("PRAGMA table_info({})", quote_ident(table)?);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
