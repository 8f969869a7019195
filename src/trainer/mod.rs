//! Retraining pipeline: load labeled logs, join macro indicators, rank
//! features, fit a model sized to the data, explain it and persist it.

pub mod asof;
pub mod dataset;
pub mod estimator;
pub mod explain;
pub mod features;
pub mod gbdt;
pub mod persist;
pub mod ridge;

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::config::TrainerConfig;
use crate::error::TrainError;
use crate::store::macro_features::load_macro_table;
use crate::store::prediction_log::load_labeled_rows;
use crate::store::Store;

use dataset::{build_dataset, BuildOptions, Dataset};
use estimator::{Estimator, ModelTier};
use explain::{explain_sample, Explanation};
use persist::{save_bundle, write_summaries, ModelArtifact, SaveReport, ARTIFACT_FORMAT_VERSION};

#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub artifact: ModelArtifact,
    pub explanation: Explanation,
}

/// What a caller needs to know after a full train-and-save pass.
#[derive(Debug, Clone, Serialize)]
pub struct TrainOutcome {
    pub tier: ModelTier,
    pub features: Vec<String>,
    pub n_train: usize,
    pub train_mae: Option<f64>,
    pub report: SaveReport,
}

pub struct AutoTrainer {
    cfg: TrainerConfig,
    model_path: PathBuf,
    dataset: Option<Dataset>,
    selected: Vec<String>,
    trained: Option<TrainedModel>,
}

impl AutoTrainer {
    pub fn new(cfg: TrainerConfig, model_path: impl Into<PathBuf>) -> Self {
        Self {
            cfg,
            model_path: model_path.into(),
            dataset: None,
            selected: Vec::new(),
            trained: None,
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref()
    }

    pub fn selected_features(&self) -> &[String] {
        &self.selected
    }

    pub fn trained(&self) -> Option<&TrainedModel> {
        self.trained.as_ref()
    }

    pub fn load_data(&mut self, store: &Store) -> Result<&Dataset, TrainError> {
        let Some(table) = load_labeled_rows(store, &self.cfg.label_col)? else {
            return Err(TrainError::MissingLabel(self.cfg.label_col.clone()));
        };
        if table.is_empty() {
            return Err(TrainError::NoTrainingData);
        }
        let macro_table = load_macro_table(store)?;
        let opts = BuildOptions {
            label_col: &self.cfg.label_col,
            initial_features: &self.cfg.initial_features,
            macro_join: self.cfg.macro_join,
            max_lag_days: self.cfg.max_lag_days,
        };
        let macro_ref = (!macro_table.is_empty()).then_some(&macro_table);
        let ds = build_dataset(&table, macro_ref, &opts)?;
        tracing::info!(
            rows = ds.n_rows(),
            candidates = ds.features.len(),
            macro_rows = macro_table.len(),
            "loaded training data"
        );
        self.selected = ds.features.clone();
        self.trained = None;
        let ds = self.dataset.insert(ds);
        Ok(&*ds)
    }

    pub fn filter_top_features(
        &mut self,
        top_k: usize,
        ensure_include: &[String],
    ) -> Result<&[String], TrainError> {
        let ds = self.dataset.as_ref().ok_or(TrainError::NotLoaded)?;
        self.selected = features::select_top_features(ds, top_k, ensure_include);
        tracing::info!(top_k, selected = ?self.selected, "selected features");
        Ok(self.selected.as_slice())
    }

    pub fn train_new_model(
        &mut self,
        shap_sample_size: usize,
        linear_fallback_n: usize,
    ) -> Result<&TrainedModel, TrainError> {
        let ds = self.dataset.as_ref().ok_or(TrainError::NotLoaded)?;
        if self.selected.is_empty() {
            return Err(TrainError::NoCandidateFeatures);
        }
        let rows = ds.rows_for(&self.selected);
        let tier = ModelTier::for_rows(ds.n_rows(), linear_fallback_n);
        let estimator = Estimator::fit(tier, &rows, &ds.label)?;

        let fitted = estimator.predict_many(&rows)?;
        let train_mae = (!fitted.is_empty()).then(|| {
            fitted
                .iter()
                .zip(&ds.label)
                .map(|(p, y)| (p - y).abs())
                .sum::<f64>()
                / fitted.len() as f64
        });
        let explanation = explain_sample(&estimator, &self.selected, &rows, shap_sample_size);
        tracing::info!(
            tier = tier.as_str(),
            rows = ds.n_rows(),
            train_mae = ?train_mae,
            explained = explanation.is_computed(),
            "trained model"
        );

        let artifact = ModelArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            trained_at: Utc::now(),
            label_col: ds.label_col.clone(),
            features: self.selected.clone(),
            n_train: ds.n_rows(),
            train_mae,
            estimator,
        };
        let trained = self.trained.insert(TrainedModel {
            artifact,
            explanation,
        });
        Ok(&*trained)
    }

    pub fn save_model(&self) -> Result<SaveReport, TrainError> {
        self.save_model_to(&self.model_path)
    }

    pub fn save_model_to(&self, path: &Path) -> Result<SaveReport, TrainError> {
        let trained = self.trained.as_ref().ok_or(TrainError::NotTrained)?;
        save_bundle(path, &trained.artifact, &trained.explanation)
    }

    /// load -> rank -> fit -> save, with the configured sample sizes.
    pub fn run(&mut self, store: &Store, top_k: usize, ensure_include: &[String]) -> Result<TrainOutcome, TrainError> {
        self.load_data(store)?;
        self.filter_top_features(top_k, ensure_include)?;
        let (shap_sample_size, linear_fallback_n) =
            (self.cfg.shap_sample_size, self.cfg.linear_fallback_n);
        self.train_new_model(shap_sample_size, linear_fallback_n)?;
        let report = self.save_model()?;
        let trained = self.trained.as_ref().ok_or(TrainError::NotTrained)?;
        Ok(TrainOutcome {
            tier: trained.artifact.tier(),
            features: trained.artifact.features.clone(),
            n_train: trained.artifact.n_train,
            train_mae: trained.artifact.train_mae,
            report,
        })
    }
}

/// Rebuild the attribution summaries of an existing artifact against the
/// current data.
pub fn recompute_explanation(
    store: &Store,
    artifact_path: &Path,
    cfg: &TrainerConfig,
) -> Result<Explanation, TrainError> {
    let artifact = ModelArtifact::load(artifact_path)?;
    let mut trainer_cfg = cfg.clone();
    trainer_cfg.label_col = artifact.label_col.clone();
    let mut trainer = AutoTrainer::new(trainer_cfg, artifact_path);
    let ds = trainer.load_data(store)?;
    let rows = ds.rows_for(&artifact.features);
    let explanation = explain_sample(
        &artifact.estimator,
        &artifact.features,
        &rows,
        cfg.shap_sample_size,
    );
    write_summaries(artifact_path, &artifact, &explanation)
        .map_err(|e| TrainError::Persist(format!("{:#}", e)))?;
    tracing::info!(
        model = %artifact_path.display(),
        explained = explanation.is_computed(),
        "recomputed explanation"
    );
    Ok(explanation)
}
