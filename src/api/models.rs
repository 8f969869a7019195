use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AppError;
use crate::registry::{artifact_digest, model_paths_match, path_string, ModelFileInfo, ModelRegistry};
use crate::store::default_model::{get_default_model, set_default_model};
use crate::store::model_meta::{self, MetaUpdate, ModelMeta};
use crate::store::Store;

use super::scheduler::ModelQuery;
use super::{blocking, AppState};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub q: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    #[serde(flatten)]
    pub file: ModelFileInfo,
    pub is_default: bool,
    pub meta: Option<ModelMeta>,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub default_model: Option<String>,
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SetDefaultRequest {
    pub model_path: String,
}

/// The DB pointer is authoritative; the mirror file only answers when the
/// table has never been written.
fn current_default(store: &Store, registry: &ModelRegistry) -> Result<Option<String>, AppError> {
    if let Some(row) = get_default_model(store)? {
        return Ok(Some(row.model_path));
    }
    Ok(registry.read_pointer_file()?)
}

fn matches_query(entry: &ModelEntry, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    let mut haystack = vec![entry.file.name.to_lowercase()];
    if let Some(meta) = &entry.meta {
        for v in [&meta.display_name, &meta.description, &meta.owner]
            .into_iter()
            .flatten()
        {
            haystack.push(v.to_lowercase());
        }
    }
    haystack.iter().any(|h| h.contains(&needle))
}

fn find_meta<'a>(metas: &'a HashMap<String, ModelMeta>, path: &str) -> Option<&'a ModelMeta> {
    metas
        .get(path)
        .or_else(|| metas.values().find(|m| model_paths_match(&m.model_path, path)))
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<ModelList>, AppError> {
    let store = state.store.clone();
    let registry = state.registry.clone();
    let list = blocking(move || {
        let default_model = current_default(&store, &registry)?;
        let metas = model_meta::list_meta(&store)?;
        let mut models: Vec<ModelEntry> = registry
            .list_models()?
            .into_iter()
            .map(|path| {
                let file = registry.file_info(std::path::Path::new(&path));
                let is_default = default_model
                    .as_deref()
                    .is_some_and(|d| model_paths_match(d, &path));
                let meta = find_meta(&metas, &path).cloned();
                ModelEntry {
                    file,
                    is_default,
                    meta,
                }
            })
            .collect();

        if let Some(needle) = q.q.as_deref().filter(|s| !s.trim().is_empty()) {
            models.retain(|m| matches_query(m, needle.trim()));
        }
        if let Some(tag) = q.tag.as_deref().filter(|s| !s.trim().is_empty()) {
            models.retain(|m| {
                m.meta
                    .as_ref()
                    .is_some_and(|meta| meta.tags.iter().any(|t| t.eq_ignore_ascii_case(tag.trim())))
            });
        }
        models.sort_by(|a, b| {
            let pinned_a = a.meta.as_ref().is_some_and(|m| m.pinned);
            let pinned_b = b.meta.as_ref().is_some_and(|m| m.pinned);
            pinned_b
                .cmp(&pinned_a)
                .then_with(|| a.file.name.cmp(&b.file.name))
        });
        Ok(ModelList {
            default_model,
            models,
        })
    })
    .await?;
    Ok(Json(list))
}

pub async fn get_default(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let store = state.store.clone();
    let registry = state.registry.clone();
    blocking(move || {
        if let Some(row) = get_default_model(&store)? {
            return Ok(Json(json!({
                "model_path": row.model_path,
                "digest": row.digest,
                "updated_at": row.updated_at,
                "source": "db",
            })));
        }
        match registry.read_pointer_file()? {
            Some(path) => Ok(Json(json!({ "model_path": path, "source": "file" }))),
            None => Err(AppError::NotFound("no default model".to_string())),
        }
    })
    .await
}

pub async fn set_default(
    State(state): State<AppState>,
    Json(req): Json<SetDefaultRequest>,
) -> Result<Json<Value>, AppError> {
    let store = state.store.clone();
    let registry = state.registry.clone();
    blocking(move || {
        let resolved = registry
            .resolve_existing(&req.model_path)
            .ok_or_else(|| AppError::NotFound(format!("model not found: {}", req.model_path)))?;
        let path = path_string(&resolved);
        let digest = artifact_digest(&resolved)?;
        set_default_model(&store, &path, Some(&digest))?;
        let pointer_file_synced = match registry.write_pointer_file(&path) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(model = %path, error = %format!("{:#}", e), "pointer file not synced");
                false
            }
        };
        tracing::info!(model = %path, "default model set");
        Ok(Json(json!({
            "model_path": path,
            "digest": digest,
            "pointer_file_synced": pointer_file_synced,
        })))
    })
    .await
}

pub async fn get_meta(
    State(state): State<AppState>,
    Query(q): Query<ModelQuery>,
) -> Result<Json<ModelMeta>, AppError> {
    let model_path = q
        .model_path
        .ok_or_else(|| AppError::BadRequest("model_path is required".to_string()))?;
    let store = state.store.clone();
    blocking(move || {
        model_meta::get_meta(&store, &model_path)?
            .map(Json)
            .ok_or_else(|| AppError::NotFound(format!("no metadata for {}", model_path)))
    })
    .await
}

pub async fn update_meta(
    State(state): State<AppState>,
    Json(update): Json<MetaUpdate>,
) -> Result<Json<ModelMeta>, AppError> {
    if update.model_path.trim().is_empty() {
        return Err(AppError::BadRequest("model_path is required".to_string()));
    }
    let store = state.store.clone();
    blocking(move || Ok(Json(model_meta::upsert_meta(&store, &update)?))).await
}

pub async fn delete(
    State(state): State<AppState>,
    Query(q): Query<ModelQuery>,
) -> Result<Json<Value>, AppError> {
    let model_path = q
        .model_path
        .ok_or_else(|| AppError::BadRequest("model_path is required".to_string()))?;
    let store = state.store.clone();
    let registry = state.registry.clone();
    blocking(move || {
        let resolved = registry
            .resolve_existing(&model_path)
            .ok_or_else(|| AppError::NotFound(format!("model not found: {}", model_path)))?;
        let path = path_string(&resolved);
        if let Some(default) = current_default(&store, &registry)? {
            if model_paths_match(&default, &path) {
                return Err(AppError::Conflict(
                    "cannot delete the default model".to_string(),
                ));
            }
        }
        let removed = registry.delete_model(&resolved)?;
        let meta_removed = model_meta::delete_meta(&store, &path)?
            | model_meta::delete_meta(&store, &model_path)?;
        tracing::info!(model = %path, files = removed.len(), meta_removed, "model deleted");
        Ok(Json(json!({
            "deleted": removed,
            "meta_removed": meta_removed,
        })))
    })
    .await
}
