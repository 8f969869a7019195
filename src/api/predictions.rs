use std::collections::BTreeMap;

use axum::extract::State;
use axum::Json;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::registry::path_string;
use crate::store::default_model::get_default_model;
use crate::store::prediction_log::{fill_labels_for_day, insert_prediction, NewPredictionLog, FEATURE_COLUMNS};
use crate::trainer::persist::ModelArtifact;

use super::{blocking, AppState};

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub time_window: Option<String>,
    #[serde(default)]
    pub size_category: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub log_id: i64,
    pub model_path: String,
    pub predicted_volatility: f64,
    pub features_used: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct LabelRequest {
    pub date: NaiveDate,
    pub actual_volatility: f64,
}

#[derive(Debug, Serialize)]
pub struct LabelResponse {
    pub date: NaiveDate,
    pub updated: usize,
}

pub async fn predict(
    State(state): State<AppState>,
    Json(req): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, AppError> {
    if let Some(bad) = req
        .features
        .keys()
        .find(|k| !FEATURE_COLUMNS.contains(&k.as_str()))
    {
        return Err(AppError::BadRequest(format!("unknown feature '{}'", bad)));
    }
    if let Some((name, _)) = req.features.iter().find(|(_, v)| !v.is_finite()) {
        return Err(AppError::BadRequest(format!("feature '{}' must be finite", name)));
    }

    let store = state.store.clone();
    let registry = state.registry.clone();
    blocking(move || {
        let requested = match req.model_path.clone() {
            Some(path) => path,
            None => match get_default_model(&store)? {
                Some(row) => row.model_path,
                None => registry
                    .read_pointer_file()?
                    .ok_or_else(|| AppError::NotFound("no default model".to_string()))?,
            },
        };
        let resolved = registry
            .resolve_existing(&requested)
            .ok_or_else(|| AppError::NotFound(format!("model not found: {}", requested)))?;
        let model_path = path_string(&resolved);
        let artifact = ModelArtifact::load(&resolved)?;
        let predicted = artifact.predict_named(|name| req.features.get(name).copied())?;

        let mut log = NewPredictionLog::new(Utc::now());
        log.user_id = req.user_id;
        log.model_path = Some(model_path.clone());
        log.status = Some("ok".to_string());
        log.predicted_volatility = Some(predicted);
        log.sector = req.sector;
        log.time_window = req.time_window;
        log.size_category = req.size_category;
        log.comment = req.comment;
        log.features = req.features;
        let log_id = insert_prediction(&store, &log)?;

        tracing::info!(model = %model_path, predicted, log_id, "prediction logged");
        Ok(Json(PredictResponse {
            log_id,
            model_path,
            predicted_volatility: predicted,
            features_used: artifact.features,
        }))
    })
    .await
}

pub async fn fill_labels(
    State(state): State<AppState>,
    Json(req): Json<LabelRequest>,
) -> Result<Json<LabelResponse>, AppError> {
    if !req.actual_volatility.is_finite() || req.actual_volatility < 0.0 {
        return Err(AppError::BadRequest(
            "actual_volatility must be a non-negative number".to_string(),
        ));
    }
    let store = state.store.clone();
    blocking(move || {
        let updated = fill_labels_for_day(&store, req.date, req.actual_volatility)?;
        Ok(Json(LabelResponse {
            date: req.date,
            updated,
        }))
    })
    .await
}
