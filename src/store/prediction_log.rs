use std::collections::BTreeMap;

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, types::Value};
use serde::Serialize;

use super::raw::{read_table, RawTable};
use super::{format_ts, quote_ident, table_columns, Store};
use crate::registry::canonical_model_path;

/// Numeric input columns persisted with every prediction.
pub const FEATURE_COLUMNS: [&str; 8] = [
    "rci",
    "atr",
    "vix",
    "volume_rate",
    "cpi_delta",
    "us10y_yield",
    "btc_return",
    "gold_volatility",
];

#[derive(Debug, Clone)]
pub struct NewPredictionLog {
    pub user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub model_path: Option<String>,
    pub status: Option<String>,
    pub error_message: Option<String>,
    pub predicted_volatility: Option<f64>,
    pub actual_volatility: Option<f64>,
    pub abs_error: Option<f64>,
    pub sector: Option<String>,
    pub time_window: Option<String>,
    pub size_category: Option<String>,
    pub comment: Option<String>,
    pub features: BTreeMap<String, f64>,
}

impl NewPredictionLog {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            user_id: None,
            created_at,
            model_path: None,
            status: None,
            error_message: None,
            predicted_volatility: None,
            actual_volatility: None,
            abs_error: None,
            sector: None,
            time_window: None,
            size_category: None,
            comment: None,
            features: BTreeMap::new(),
        }
    }
}

/// The subset of a labeled log row needed for error metrics.
#[derive(Debug, Clone, Serialize)]
pub struct LabeledOutcome {
    pub model_path: String,
    pub predicted_volatility: Option<f64>,
    pub actual_volatility: f64,
    pub abs_error: Option<f64>,
}

pub fn insert_prediction(store: &Store, log: &NewPredictionLog) -> Result<i64> {
    for name in log.features.keys() {
        if !FEATURE_COLUMNS.contains(&name.as_str()) {
            bail!("unknown feature column '{}'", name);
        }
    }

    let mut columns = vec![
        "user_id",
        "created_at",
        "model_path",
        "status",
        "error_message",
        "predicted_volatility",
        "actual_volatility",
        "abs_error",
        "sector",
        "time_window",
        "size_category",
        "comment",
    ];
    let mut values: Vec<Value> = vec![
        log.user_id.into(),
        format_ts(log.created_at).into(),
        log.model_path.as_deref().map(canonical_model_path).into(),
        log.status.clone().into(),
        log.error_message.clone().into(),
        log.predicted_volatility.into(),
        log.actual_volatility.into(),
        log.abs_error.into(),
        log.sector.clone().into(),
        log.time_window.clone().into(),
        log.size_category.clone().into(),
        log.comment.clone().into(),
    ];
    for (name, value) in &log.features {
        if let Some(col) = FEATURE_COLUMNS.iter().find(|c| **c == name.as_str()) {
            columns.push(*col);
            values.push((*value).into());
        }
    }

    let placeholders = (1..=columns.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO prediction_logs ({}) VALUES ({})",
        columns.join(", "),
        placeholders
    );

    let conn = store.open()?;
    conn.execute(&sql, params_from_iter(values))?;
    Ok(conn.last_insert_rowid())
}

/// Every labeled row that names a model, in insertion order.
pub fn load_labeled_outcomes(store: &Store) -> Result<Vec<LabeledOutcome>> {
    let conn = store.open()?;
    let mut stmt = conn.prepare(
        r#"
        SELECT model_path, predicted_volatility, actual_volatility, abs_error
        FROM prediction_logs
        WHERE actual_volatility IS NOT NULL AND model_path IS NOT NULL
        ORDER BY id ASC
        "#,
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(LabeledOutcome {
            model_path: row.get(0)?,
            predicted_volatility: row.get(1)?,
            actual_volatility: row.get(2)?,
            abs_error: row.get(3)?,
        })
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// `SELECT *` over rows with a non-null label. Returns `None` when the label
/// column does not exist.
pub fn load_labeled_rows(store: &Store, label_col: &str) -> Result<Option<RawTable>> {
    let conn = store.open()?;
    let columns = table_columns(&conn, "prediction_logs")?;
    if !columns.iter().any(|c| c == label_col) {
        return Ok(None);
    }
    let sql = format!(
        "SELECT * FROM prediction_logs WHERE {} IS NOT NULL ORDER BY id ASC",
        quote_ident(label_col)?
    );
    Ok(Some(read_table(&conn, &sql, [])?))
}

/// Set the realized label on every still-unlabeled row created on `day`.
/// `abs_error` is derived whenever a prediction exists.
pub fn fill_labels_for_day(store: &Store, day: NaiveDate, actual_volatility: f64) -> Result<usize> {
    if !actual_volatility.is_finite() {
        bail!("actual_volatility must be finite");
    }
    let conn = store.open()?;
    let updated = conn.execute(
        r#"
        UPDATE prediction_logs
        SET actual_volatility = ?1,
            abs_error = CASE
                WHEN predicted_volatility IS NOT NULL
                THEN ABS(predicted_volatility - ?1)
                ELSE NULL
            END
        WHERE substr(created_at, 1, 10) = ?2 AND actual_volatility IS NULL
        "#,
        params![actual_volatility, day.format("%Y-%m-%d").to_string()],
    )?;
    tracing::info!(day = %day, updated, "filled prediction labels");
    Ok(updated)
}
