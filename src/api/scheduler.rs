use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::scheduler::{DryRun, EvalNow, ManualRetrain, Promotion, RetrainIfNeeded, RunRequest, RunResult};
use crate::store::model_eval::EvalRecord;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct ModelQuery {
    pub model_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RetrainQuery {
    pub model_path: Option<String>,
    pub mae_threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub limit: Option<usize>,
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "time": Utc::now().to_rfc3339() }))
}

pub async fn status(
    State(state): State<AppState>,
    Query(q): Query<StatusQuery>,
) -> Result<Json<Vec<EvalRecord>>, AppError> {
    Ok(Json(state.scheduler.status(q.limit).await?))
}

pub async fn run(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunResult>, AppError> {
    Ok(Json(state.scheduler.run(req).await?))
}

pub async fn eval_now(
    State(state): State<AppState>,
    Query(q): Query<ModelQuery>,
) -> Result<Json<EvalNow>, AppError> {
    Ok(Json(state.scheduler.eval_now(q.model_path).await?))
}

pub async fn retrain_if_needed(
    State(state): State<AppState>,
    Query(q): Query<RetrainQuery>,
) -> Result<Json<RetrainIfNeeded>, AppError> {
    Ok(Json(
        state
            .scheduler
            .retrain_if_needed(q.model_path, q.mae_threshold)
            .await?,
    ))
}

pub async fn retrain_dryrun(
    State(state): State<AppState>,
    Query(q): Query<ModelQuery>,
) -> Result<Json<DryRun>, AppError> {
    Ok(Json(state.scheduler.retrain_dryrun(q.model_path).await?))
}

pub async fn retrain_run(
    State(state): State<AppState>,
    Query(q): Query<ModelQuery>,
) -> Result<Json<ManualRetrain>, AppError> {
    Ok(Json(state.scheduler.retrain_run(q.model_path).await?))
}

pub async fn retrain_promote(
    State(state): State<AppState>,
    Query(q): Query<ModelQuery>,
) -> Result<Json<Promotion>, AppError> {
    let model_path = q
        .model_path
        .ok_or_else(|| AppError::BadRequest("model_path is required".to_string()))?;
    Ok(Json(state.scheduler.retrain_promote(model_path).await?))
}
