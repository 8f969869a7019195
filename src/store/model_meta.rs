use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{format_ts, parse_ts, Store};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelMeta {
    pub model_path: String,
    pub display_name: Option<String>,
    pub version: Option<String>,
    pub owner: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update: `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetaUpdate {
    pub model_path: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub pinned: Option<bool>,
}

const SELECT_META: &str = r#"
    SELECT model_path, display_name, version, owner, description, tags, pinned,
           created_at, updated_at
    FROM model_meta
"#;

type MetaRow = (
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    bool,
    String,
    String,
);

fn read_row(row: &Row<'_>) -> rusqlite::Result<MetaRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn into_meta(raw: MetaRow) -> Result<ModelMeta> {
    let (model_path, display_name, version, owner, description, tags, pinned, created, updated) =
        raw;
    let tags: Vec<String> = serde_json::from_str(&tags)
        .with_context(|| format!("invalid tags for {}", model_path))?;
    Ok(ModelMeta {
        model_path,
        display_name,
        version,
        owner,
        description,
        tags,
        pinned,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

pub fn get_meta(store: &Store, model_path: &str) -> Result<Option<ModelMeta>> {
    let conn = store.open()?;
    let sql = format!("{} WHERE model_path = ?1", SELECT_META);
    conn.query_row(&sql, [model_path], read_row)
        .optional()?
        .map(into_meta)
        .transpose()
}

pub fn list_meta(store: &Store) -> Result<HashMap<String, ModelMeta>> {
    let conn = store.open()?;
    let mut stmt = conn.prepare(SELECT_META)?;
    let rows = stmt.query_map([], read_row)?;
    let mut out = HashMap::new();
    for row in rows {
        let meta = into_meta(row?)?;
        out.insert(meta.model_path.clone(), meta);
    }
    Ok(out)
}

/// The most recently touched pinned model, if any.
pub fn pinned_model(store: &Store) -> Result<Option<String>> {
    let conn = store.open()?;
    Ok(conn
        .query_row(
            "SELECT model_path FROM model_meta WHERE pinned = 1 ORDER BY updated_at DESC LIMIT 1",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?)
}

pub fn upsert_meta(store: &Store, update: &MetaUpdate) -> Result<ModelMeta> {
    let now = format_ts(Utc::now());
    let tags = update
        .tags
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let conn = store.open()?;
    conn.execute(
        r#"
        INSERT INTO model_meta (
            model_path, display_name, version, owner, description, tags, pinned,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, COALESCE(?6, '[]'), COALESCE(?7, 0), ?8, ?8)
        ON CONFLICT(model_path) DO UPDATE SET
            display_name = COALESCE(?2, display_name),
            version = COALESCE(?3, version),
            owner = COALESCE(?4, owner),
            description = COALESCE(?5, description),
            tags = COALESCE(?6, tags),
            pinned = COALESCE(?7, pinned),
            updated_at = ?8
        "#,
        params![
            update.model_path,
            update.display_name,
            update.version,
            update.owner,
            update.description,
            tags,
            update.pinned,
            now,
        ],
    )?;
    drop(conn);
    get_meta(store, &update.model_path)?
        .with_context(|| format!("metadata for {} vanished after upsert", update.model_path))
}

pub fn delete_meta(store: &Store, model_path: &str) -> Result<bool> {
    let conn = store.open()?;
    let n = conn.execute("DELETE FROM model_meta WHERE model_path = ?1", [model_path])?;
    Ok(n > 0)
}
