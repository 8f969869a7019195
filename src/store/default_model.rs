use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::{format_ts, parse_ts, Store};

/// The authoritative "currently served" model. One row at most.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DefaultModel {
    pub model_path: String,
    pub digest: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub fn get_default_model(store: &Store) -> Result<Option<DefaultModel>> {
    let conn = store.open()?;
    let row = conn
        .query_row(
            "SELECT model_path, digest, updated_at FROM default_model WHERE slot = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    row.map(|(model_path, digest, updated_at)| {
        Ok(DefaultModel {
            model_path,
            digest,
            updated_at: parse_ts(&updated_at)?,
        })
    })
    .transpose()
}

pub(crate) fn set_default_model_on(
    conn: &Connection,
    model_path: &str,
    digest: Option<&str>,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO default_model (slot, model_path, digest, updated_at)
        VALUES (1, ?1, ?2, ?3)
        ON CONFLICT(slot) DO UPDATE SET
            model_path = excluded.model_path,
            digest = excluded.digest,
            updated_at = excluded.updated_at
        "#,
        params![model_path, digest, format_ts(Utc::now())],
    )?;
    Ok(())
}

pub fn set_default_model(store: &Store, model_path: &str, digest: Option<&str>) -> Result<()> {
    let conn = store.open()?;
    set_default_model_on(&conn, model_path, digest)
}
