//! MAE-driven retraining: evaluate every artifact, retrain the ones whose
//! trigger fires, optionally promote, audit every decision and notify.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{SchedulerConfig, TrainerConfig};
use crate::error::AppError;
use crate::metrics::{compute_mae_for_model, MaeStat};
use crate::notifier::{Notifier, NotifyReport};
use crate::registry::{artifact_digest, canonical_model_path, path_string, ModelRegistry};
use crate::store::model_eval::{insert_eval, record_promotion, recent_evals, EvalRecord, NewEvalRecord};
use crate::store::model_meta::pinned_model;
use crate::store::Store;
use crate::trainer::estimator::ModelTier;
use crate::trainer::{recompute_explanation, AutoTrainer, TrainOutcome};

pub const NO_TRAINING_DATA_NOTE: &str = "no training data";
pub const MANUAL_TRIGGER: &str = "manual";

fn default_top_k() -> usize {
    3
}

fn default_auto_promote() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub mae_threshold: Option<f64>,
    #[serde(default)]
    pub min_new_labels: Option<usize>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_auto_promote")]
    pub auto_promote: bool,
    #[serde(default)]
    pub note: Option<String>,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            mae_threshold: None,
            min_new_labels: None,
            top_k: default_top_k(),
            auto_promote: default_auto_promote(),
            note: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerReason {
    Threshold,
    Count,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Count => "count",
        }
    }
}

/// `threshold` wins over `count`; an unknown MAE never crosses a threshold.
pub fn decide_trigger(
    stat: &MaeStat,
    mae_threshold: Option<f64>,
    min_new_labels: Option<usize>,
) -> Option<TriggerReason> {
    if let (Some(threshold), Some(mae)) = (mae_threshold, stat.mae) {
        if mae > threshold {
            return Some(TriggerReason::Threshold);
        }
    }
    match min_new_labels {
        Some(min) if stat.n >= min => Some(TriggerReason::Count),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckedModel {
    pub model_path: String,
    pub mae: Option<f64>,
    pub n: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggeredModel {
    pub base_model: String,
    pub reason: TriggerReason,
    pub old_mae: Option<f64>,
    pub old_n: usize,
    pub new_model_path: Option<String>,
    pub new_train_mae: Option<f64>,
    pub promoted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointer_file_synced: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation_recomputed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TriggeredModel {
    fn pending(base_model: &str, reason: TriggerReason, stat: MaeStat) -> Self {
        Self {
            base_model: base_model.to_string(),
            reason,
            old_mae: stat.mae,
            old_n: stat.n,
            new_model_path: None,
            new_train_mae: None,
            promoted: false,
            pointer_file_synced: None,
            explanation_recomputed: None,
            note: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub checked_models: Vec<CheckedModel>,
    pub triggered: Vec<TriggeredModel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotifyReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalNow {
    pub model_path: String,
    pub mae: Option<f64>,
    pub n: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetrainIfNeeded {
    Skipped {
        model_path: String,
        mae: f64,
        threshold: f64,
    },
    Retrained {
        model_path: String,
        mae_before: f64,
        mae_after: Option<f64>,
        new_train_mae: Option<f64>,
        tier: ModelTier,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRun {
    pub model_path: String,
    pub mae: Option<f64>,
    pub n: usize,
    pub threshold: f64,
    pub would_retrain: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualRetrain {
    pub base_model: String,
    pub new_model_path: String,
    pub new_train_mae: Option<f64>,
    pub tier: ModelTier,
    pub features: Vec<String>,
    pub n_train: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Promotion {
    pub model_path: String,
    pub digest: Option<String>,
    pub pointer_file_synced: bool,
    pub explanation_recomputed: bool,
}

#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    registry: ModelRegistry,
    trainer_cfg: TrainerConfig,
    cfg: SchedulerConfig,
    notifier: Arc<Notifier>,
    run_lock: Arc<Mutex<()>>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        registry: ModelRegistry,
        trainer_cfg: TrainerConfig,
        cfg: SchedulerConfig,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            registry,
            trainer_cfg,
            cfg,
            notifier,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(Scheduler) -> Result<T, AppError> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(this))
            .await
            .map_err(|e| AppError::Internal(e.into()))?
    }

    fn try_lock(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, AppError> {
        self.run_lock
            .try_lock()
            .map_err(|_| AppError::Conflict("a scheduler run is already in progress".to_string()))
    }

    pub async fn run(&self, req: RunRequest) -> Result<RunResult, AppError> {
        validate_threshold(req.mae_threshold)?;
        let _guard = self.try_lock()?;
        let mut result = self.blocking(move |this| this.run_blocking(&req)).await?;

        let promoted: Vec<&TriggeredModel> = result.triggered.iter().filter(|t| t.promoted).collect();
        if !promoted.is_empty() {
            let events: Vec<serde_json::Value> = promoted
                .iter()
                .map(|t| {
                    json!({
                        "base_model": t.base_model,
                        "reason": t.reason,
                        "mae_before": t.old_mae,
                        "n_before": t.old_n,
                        "new_model_path": t.new_model_path,
                        "new_train_mae": t.new_train_mae,
                    })
                })
                .collect();
            let payload = json!({ "run_id": result.run_id, "promoted": events });
            let title = format!("[volai] {} model(s) promoted", promoted.len());
            result.notification = Some(self.notifier.notify_all(&title, &payload).await);
        }
        Ok(result)
    }

    fn run_blocking(&self, req: &RunRequest) -> Result<RunResult, AppError> {
        let run_id = Uuid::new_v4().to_string();
        let models = self.registry.list_models()?;
        tracing::info!(run_id = %run_id, models = models.len(), "scheduler run started");

        let mut checked = Vec::with_capacity(models.len());
        for model in &models {
            let stat = compute_mae_for_model(&self.store, model)?;
            checked.push(CheckedModel {
                model_path: model.clone(),
                mae: stat.mae,
                n: stat.n,
            });
        }

        let mut triggered = Vec::new();
        for entry in &checked {
            let stat = MaeStat {
                mae: entry.mae,
                n: entry.n,
            };
            let Some(reason) = decide_trigger(&stat, req.mae_threshold, req.min_new_labels) else {
                continue;
            };
            tracing::info!(
                run_id = %run_id,
                model = %entry.model_path,
                reason = reason.as_str(),
                mae = ?stat.mae,
                n = stat.n,
                "retrain triggered"
            );
            let outcome = match self.retrain_one(&run_id, &entry.model_path, stat, reason, req) {
                Ok(outcome) => outcome,
                Err(e) => self.record_failure(&run_id, &entry.model_path, stat, reason, &e),
            };
            triggered.push(outcome);
        }

        tracing::info!(
            run_id = %run_id,
            checked = checked.len(),
            triggered = triggered.len(),
            promoted = triggered.iter().filter(|t| t.promoted).count(),
            "scheduler run finished"
        );
        Ok(RunResult {
            run_id,
            checked_models: checked,
            triggered,
            notification: None,
        })
    }

    fn audit_record(run_id: &str, base_model: &str, stat: MaeStat, reason: TriggerReason) -> NewEvalRecord {
        NewEvalRecord {
            run_id: Some(run_id.to_string()),
            model_path: base_model.to_string(),
            metric_mae: stat.mae,
            n_samples: stat.n,
            triggered_by: Some(reason.as_str().to_string()),
            ..NewEvalRecord::default()
        }
    }

    /// A model whose retrain failed is audited with the error and the batch
    /// moves on; earlier promotions stay committed.
    fn record_failure(
        &self,
        run_id: &str,
        base_model: &str,
        stat: MaeStat,
        reason: TriggerReason,
        err: &AppError,
    ) -> TriggeredModel {
        let note = err.to_string();
        tracing::error!(run_id = %run_id, model = %base_model, error = %note, "retrain failed");
        let mut rec = Self::audit_record(run_id, base_model, stat, reason);
        rec.note = Some(note.clone());
        if let Err(e) = insert_eval(&self.store, &rec) {
            tracing::error!(model = %base_model, error = %format!("{:#}", e), "failed to audit retrain failure");
        }
        let mut triggered = TriggeredModel::pending(base_model, reason, stat);
        triggered.note = Some(note);
        triggered
    }

    fn retrain_one(
        &self,
        run_id: &str,
        base_model: &str,
        stat: MaeStat,
        reason: TriggerReason,
        req: &RunRequest,
    ) -> Result<TriggeredModel, AppError> {
        let new_path = self.registry.new_auto_path(base_model, Utc::now());
        let mut rec = Self::audit_record(run_id, base_model, stat, reason);
        rec.note = req.note.clone();
        let mut triggered = TriggeredModel::pending(base_model, reason, stat);

        let Some(outcome) = self.train_into(&new_path, req.top_k)? else {
            rec.note = Some(NO_TRAINING_DATA_NOTE.to_string());
            insert_eval(&self.store, &rec)?;
            triggered.note = Some(NO_TRAINING_DATA_NOTE.to_string());
            return Ok(triggered);
        };

        rec.new_model_path = Some(outcome.report.model_path.clone());
        rec.new_model_digest = Some(outcome.report.digest.clone());
        triggered.new_model_path = Some(outcome.report.model_path.clone());
        triggered.new_train_mae = outcome.train_mae;

        if req.auto_promote {
            let promotion = self.promote(&rec, &outcome.report.model_path)?;
            triggered.promoted = true;
            triggered.pointer_file_synced = Some(promotion.pointer_file_synced);
            triggered.explanation_recomputed = Some(promotion.explanation_recomputed);
        } else {
            insert_eval(&self.store, &rec)?;
        }
        Ok(triggered)
    }

    /// `None` when there is nothing to learn from; other training failures
    /// propagate.
    fn train_into(&self, target: &str, top_k: usize) -> Result<Option<TrainOutcome>, AppError> {
        let mut trainer = AutoTrainer::new(self.trainer_cfg.clone(), target);
        match trainer.run(&self.store, top_k, &[]) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) if e.is_data_unavailable() => {
                tracing::warn!(model = %target, error = %e, "skipping retrain");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Audit row and default pointer commit together; the mirror file and the
    /// explanation refresh follow and only report their outcome.
    fn promote(&self, rec: &NewEvalRecord, model_path: &str) -> Result<Promotion, AppError> {
        record_promotion(&self.store, rec, model_path)?;

        let pointer_file_synced = match self.registry.write_pointer_file(model_path) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(model = %model_path, error = %format!("{:#}", e), "pointer file not synced");
                false
            }
        };
        let explanation_recomputed =
            match recompute_explanation(&self.store, Path::new(model_path), &self.trainer_cfg) {
                Ok(explanation) => explanation.is_computed(),
                Err(e) => {
                    tracing::warn!(model = %model_path, error = %e, "explanation recompute failed after promotion");
                    false
                }
            };
        tracing::info!(
            model = %model_path,
            pointer_file_synced,
            explanation_recomputed,
            "model promoted"
        );
        Ok(Promotion {
            model_path: model_path.to_string(),
            digest: rec.new_model_digest.clone(),
            pointer_file_synced,
            explanation_recomputed,
        })
    }

    fn resolve_target(&self, model_path: Option<String>) -> Result<String, AppError> {
        if let Some(path) = model_path.filter(|p| !p.trim().is_empty()) {
            return Ok(canonical_model_path(&path));
        }
        pinned_model(&self.store)?
            .map(|p| canonical_model_path(&p))
            .ok_or_else(|| AppError::DataUnavailable("No pinned model".to_string()))
    }

    pub async fn status(&self, limit: Option<usize>) -> Result<Vec<EvalRecord>, AppError> {
        let limit = limit
            .unwrap_or(self.cfg.status_limit)
            .clamp(1, self.cfg.status_limit);
        self.blocking(move |this| Ok(recent_evals(&this.store, limit)?))
            .await
    }

    pub async fn eval_now(&self, model_path: Option<String>) -> Result<EvalNow, AppError> {
        self.blocking(move |this| {
            let model_path = this.resolve_target(model_path)?;
            let stat = compute_mae_for_model(&this.store, &model_path)?;
            Ok(EvalNow {
                model_path,
                mae: stat.mae,
                n: stat.n,
            })
        })
        .await
    }

    pub async fn retrain_if_needed(
        &self,
        model_path: Option<String>,
        mae_threshold: Option<f64>,
    ) -> Result<RetrainIfNeeded, AppError> {
        validate_threshold(mae_threshold)?;
        let threshold = mae_threshold.unwrap_or(self.cfg.default_mae_threshold);
        let _guard = self.try_lock()?;
        self.blocking(move |this| this.retrain_if_needed_blocking(model_path, threshold))
            .await
    }

    fn retrain_if_needed_blocking(
        &self,
        model_path: Option<String>,
        threshold: f64,
    ) -> Result<RetrainIfNeeded, AppError> {
        let model_path = self.resolve_target(model_path)?;
        let stat = compute_mae_for_model(&self.store, &model_path)?;
        let Some(mae) = stat.mae else {
            return Err(AppError::DataUnavailable("No evaluation data".to_string()));
        };
        if mae <= threshold {
            return Ok(RetrainIfNeeded::Skipped {
                model_path,
                mae,
                threshold,
            });
        }

        let mut rec = NewEvalRecord {
            model_path: model_path.clone(),
            metric_mae: stat.mae,
            n_samples: stat.n,
            triggered_by: Some(TriggerReason::Threshold.as_str().to_string()),
            ..NewEvalRecord::default()
        };
        let Some(outcome) = self.train_into(&model_path, self.cfg.default_top_k)? else {
            rec.note = Some(NO_TRAINING_DATA_NOTE.to_string());
            insert_eval(&self.store, &rec)?;
            return Err(AppError::DataUnavailable(NO_TRAINING_DATA_NOTE.to_string()));
        };
        rec.new_model_path = Some(outcome.report.model_path.clone());
        rec.new_model_digest = Some(outcome.report.digest.clone());
        rec.note = Some("retrained in place".to_string());
        insert_eval(&self.store, &rec)?;

        let after = compute_mae_for_model(&self.store, &model_path)?;
        Ok(RetrainIfNeeded::Retrained {
            model_path,
            mae_before: mae,
            mae_after: after.mae,
            new_train_mae: outcome.train_mae,
            tier: outcome.tier,
        })
    }

    pub async fn retrain_dryrun(&self, model_path: Option<String>) -> Result<DryRun, AppError> {
        self.blocking(move |this| {
            let model_path = this.resolve_target(model_path)?;
            let stat = compute_mae_for_model(&this.store, &model_path)?;
            let threshold = this.cfg.default_mae_threshold;
            let would_retrain = decide_trigger(&stat, Some(threshold), None).is_some();
            Ok(DryRun {
                model_path,
                mae: stat.mae,
                n: stat.n,
                threshold,
                would_retrain,
            })
        })
        .await
    }

    pub async fn retrain_run(&self, model_path: Option<String>) -> Result<ManualRetrain, AppError> {
        let _guard = self.try_lock()?;
        self.blocking(move |this| {
            let base_model = this.resolve_target(model_path)?;
            let stat = compute_mae_for_model(&this.store, &base_model)?;
            let new_path = this.registry.new_auto_path(&base_model, Utc::now());
            let mut rec = NewEvalRecord {
                model_path: base_model.clone(),
                metric_mae: stat.mae,
                n_samples: stat.n,
                triggered_by: Some(MANUAL_TRIGGER.to_string()),
                ..NewEvalRecord::default()
            };
            let Some(outcome) = this.train_into(&new_path, this.cfg.default_top_k)? else {
                rec.note = Some(NO_TRAINING_DATA_NOTE.to_string());
                insert_eval(&this.store, &rec)?;
                return Err(AppError::DataUnavailable(NO_TRAINING_DATA_NOTE.to_string()));
            };
            rec.new_model_path = Some(outcome.report.model_path.clone());
            rec.new_model_digest = Some(outcome.report.digest.clone());
            insert_eval(&this.store, &rec)?;
            Ok(ManualRetrain {
                base_model,
                new_model_path: outcome.report.model_path,
                new_train_mae: outcome.train_mae,
                tier: outcome.tier,
                features: outcome.features,
                n_train: outcome.n_train,
            })
        })
        .await
    }

    pub async fn retrain_promote(&self, model_path: String) -> Result<Promotion, AppError> {
        if model_path.trim().is_empty() {
            return Err(AppError::BadRequest("model_path is required".to_string()));
        }
        let _guard = self.try_lock()?;
        self.blocking(move |this| {
            let resolved = this
                .registry
                .resolve_existing(&model_path)
                .ok_or_else(|| AppError::NotFound(format!("model not found: {}", model_path)))?;
            let target = path_string(&resolved);
            let stat = compute_mae_for_model(&this.store, &target)?;
            let rec = NewEvalRecord {
                model_path: target.clone(),
                metric_mae: stat.mae,
                n_samples: stat.n,
                triggered_by: Some(MANUAL_TRIGGER.to_string()),
                new_model_path: Some(target.clone()),
                new_model_digest: Some(artifact_digest(&resolved)?),
                ..NewEvalRecord::default()
            };
            this.promote(&rec, &target)
        })
        .await
    }
}

fn validate_threshold(threshold: Option<f64>) -> Result<(), AppError> {
    match threshold {
        Some(t) if !t.is_finite() || t < 0.0 => Err(AppError::BadRequest(format!(
            "mae_threshold must be a non-negative number, got {}",
            t
        ))),
        _ => Ok(()),
    }
}
