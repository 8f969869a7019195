use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::default_model::set_default_model_on;
use super::{format_ts, parse_ts, Store};

/// One audit row per scheduler decision. Rows are never updated.
#[derive(Debug, Clone, Default)]
pub struct NewEvalRecord {
    pub run_id: Option<String>,
    pub model_path: String,
    pub metric_mae: Option<f64>,
    pub n_samples: usize,
    pub triggered_by: Option<String>,
    pub note: Option<String>,
    pub new_model_path: Option<String>,
    pub new_model_digest: Option<String>,
    pub promoted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalRecord {
    pub id: i64,
    pub run_id: Option<String>,
    pub ran_at: DateTime<Utc>,
    pub model_path: String,
    pub metric_mae: Option<f64>,
    pub n_samples: Option<i64>,
    pub triggered_by: Option<String>,
    pub new_model_path: Option<String>,
    pub new_model_digest: Option<String>,
    pub promoted: bool,
    pub note: Option<String>,
}

fn insert_on(conn: &Connection, rec: &NewEvalRecord) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO model_eval (
            run_id, model_path, ran_at, metric_mae, n_samples, triggered_by,
            note, new_model_path, new_model_digest, promoted
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            rec.run_id,
            rec.model_path,
            format_ts(Utc::now()),
            rec.metric_mae,
            rec.n_samples as i64,
            rec.triggered_by,
            rec.note,
            rec.new_model_path,
            rec.new_model_digest,
            rec.promoted,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_eval(store: &Store, rec: &NewEvalRecord) -> Result<i64> {
    let conn = store.open()?;
    insert_on(&conn, rec)
}

/// Insert a promoted audit row and move the default pointer in one
/// transaction, so history never claims a promotion the pointer lacks.
pub fn record_promotion(store: &Store, rec: &NewEvalRecord, promoted_path: &str) -> Result<i64> {
    let mut conn = store.open()?;
    let tx = conn.transaction()?;
    let mut promoted = rec.clone();
    promoted.promoted = true;
    let id = insert_on(&tx, &promoted)?;
    set_default_model_on(&tx, promoted_path, rec.new_model_digest.as_deref())?;
    tx.commit()?;
    Ok(id)
}

pub fn recent_evals(store: &Store, limit: usize) -> Result<Vec<EvalRecord>> {
    let conn = store.open()?;
    let mut stmt = conn.prepare(
        r#"
        SELECT id, run_id, ran_at, model_path, metric_mae, n_samples, triggered_by,
               new_model_path, new_model_digest, promoted, note
        FROM model_eval
        ORDER BY ran_at DESC, id DESC
        LIMIT ?1
        "#,
    )?;
    let rows = stmt.query_map([limit as i64], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<f64>>(4)?,
            row.get::<_, Option<i64>>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, Option<String>>(8)?,
            row.get::<_, bool>(9)?,
            row.get::<_, Option<String>>(10)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (
            id,
            run_id,
            ran_at,
            model_path,
            metric_mae,
            n_samples,
            triggered_by,
            new_model_path,
            new_model_digest,
            promoted,
            note,
        ) = row?;
        out.push(EvalRecord {
            id,
            run_id,
            ran_at: parse_ts(&ran_at)?,
            model_path,
            metric_mae,
            n_samples,
            triggered_by,
            new_model_path,
            new_model_digest,
            promoted,
            note,
        });
    }
    Ok(out)
}
