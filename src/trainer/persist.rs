use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TrainError;
use crate::registry::{
    artifact_digest, companion_path, path_string, COEF_SUMMARY_SUFFIX, COMPAT_SUMMARY_FILE,
    SHAP_SUMMARY_SUFFIX, SHAP_VALUES_SUFFIX,
};

use super::estimator::{Estimator, ModelTier};
use super::explain::Explanation;
use super::ridge::RidgeModel;

pub const ARTIFACT_FORMAT_VERSION: u32 = 2;

/// What lands on disk for one trained model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub trained_at: DateTime<Utc>,
    pub label_col: String,
    pub features: Vec<String>,
    pub n_train: usize,
    #[serde(default)]
    pub train_mae: Option<f64>,
    pub estimator: Estimator,
}

impl ModelArtifact {
    pub fn tier(&self) -> ModelTier {
        self.estimator.tier()
    }

    /// Predict from named inputs; absent names are treated as missing.
    pub fn predict_named<F>(&self, lookup: F) -> Result<f64, TrainError>
    where
        F: Fn(&str) -> Option<f64>,
    {
        let row: Vec<Option<f64>> = self.features.iter().map(|f| lookup(f)).collect();
        self.estimator.predict(&row)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model {}", path.display()))?;
        let artifact: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse model {}", path.display()))?;
        Ok(artifact)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let body = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveReport {
    pub model_path: String,
    pub digest: String,
    pub shap_summary_path: String,
    pub compat_summary_path: String,
    pub shap_values_path: Option<String>,
    pub coef_summary_path: Option<String>,
    pub explanation_computed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryPaths {
    pub shap_summary_path: String,
    pub compat_summary_path: String,
    pub shap_values_path: Option<String>,
    pub coef_summary_path: Option<String>,
}

pub fn compat_summary_path(model_path: &Path) -> PathBuf {
    model_path.with_file_name(COMPAT_SUMMARY_FILE)
}

fn write_shap_summary(path: &Path, rows: &[(String, f64)]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    wtr.write_record(["feature", "mean_abs_shap"])?;
    for (feature, value) in rows {
        wtr.write_record([feature.as_str(), value.to_string().as_str()])?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct ShapValuesFile<'a> {
    features: &'a [String],
    base_value: f64,
    values: &'a [Vec<f64>],
}

/// `importance = |coef| * std`; a zero or undefined std counts as no
/// importance.
pub fn coef_importance(model: &RidgeModel, features: &[String]) -> Vec<(String, f64, f64, f64)> {
    let mut out: Vec<(String, f64, f64, f64)> = features
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let coef_abs = model.coef.get(j).map_or(0.0, |c| c.abs());
            let std = model.stds.get(j).copied().unwrap_or(0.0);
            let importance = if std.is_finite() && std > 0.0 {
                coef_abs * std
            } else {
                0.0
            };
            (name.clone(), coef_abs, std, importance)
        })
        .collect();
    out.sort_by(|a, b| b.3.total_cmp(&a.3));
    out
}

fn write_coef_summary(path: &Path, model: &RidgeModel, features: &[String]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    wtr.write_record(["feature", "coef_abs", "std", "coef_importance"])?;
    for (feature, coef_abs, std, importance) in coef_importance(model, features) {
        wtr.write_record([
            feature,
            coef_abs.to_string(),
            std.to_string(),
            importance.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write the attribution summaries that sit next to an artifact. The summary
/// CSV is always written (zero-filled when degraded); the raw values file is
/// written only for a computed explanation and removed otherwise.
pub fn write_summaries(
    model_path: &Path,
    artifact: &ModelArtifact,
    explanation: &Explanation,
) -> Result<SummaryPaths> {
    let summary = explanation.mean_abs(&artifact.features);
    let shap_summary = companion_path(model_path, SHAP_SUMMARY_SUFFIX);
    let compat = compat_summary_path(model_path);
    write_shap_summary(&shap_summary, &summary)?;
    write_shap_summary(&compat, &summary)?;

    let values_path = companion_path(model_path, SHAP_VALUES_SUFFIX);
    let shap_values_path = match explanation {
        Explanation::Computed {
            features,
            base_value,
            values,
        } => {
            let body = serde_json::to_vec(&ShapValuesFile {
                features,
                base_value: *base_value,
                values,
            })?;
            std::fs::write(&values_path, body)
                .with_context(|| format!("failed to write {}", values_path.display()))?;
            Some(path_string(&values_path))
        }
        Explanation::Degraded { .. } => {
            if values_path.exists() {
                std::fs::remove_file(&values_path)
                    .with_context(|| format!("failed to remove {}", values_path.display()))?;
            }
            None
        }
    };

    let coef_summary_path = match &artifact.estimator {
        Estimator::Ridge(model) => {
            let path = companion_path(model_path, COEF_SUMMARY_SUFFIX);
            write_coef_summary(&path, model, &artifact.features)?;
            Some(path_string(&path))
        }
        _ => None,
    };

    Ok(SummaryPaths {
        shap_summary_path: path_string(&shap_summary),
        compat_summary_path: path_string(&compat),
        shap_values_path,
        coef_summary_path,
    })
}

pub fn save_bundle(
    model_path: &Path,
    artifact: &ModelArtifact,
    explanation: &Explanation,
) -> Result<SaveReport, TrainError> {
    let persist = |e: anyhow::Error| TrainError::Persist(format!("{:#}", e));
    artifact.save(model_path).map_err(persist)?;
    let paths = write_summaries(model_path, artifact, explanation).map_err(persist)?;
    let digest = artifact_digest(model_path).map_err(persist)?;
    tracing::info!(
        model = %model_path.display(),
        tier = artifact.tier().as_str(),
        features = artifact.features.len(),
        explained = explanation.is_computed(),
        "saved model artifact"
    );
    Ok(SaveReport {
        model_path: path_string(model_path),
        digest,
        shap_summary_path: paths.shap_summary_path,
        compat_summary_path: paths.compat_summary_path,
        shap_values_path: paths.shap_values_path,
        coef_summary_path: paths.coef_summary_path,
        explanation_computed: explanation.is_computed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ridge_artifact() -> ModelArtifact {
        let rows = vec![
            vec![Some(1.0), Some(2.0)],
            vec![Some(2.0), Some(2.0)],
            vec![Some(3.0), Some(2.0)],
        ];
        let model = RidgeModel::fit(&rows, &[0.1, 0.2, 0.3], 1.0).unwrap();
        ModelArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            trained_at: Utc::now(),
            label_col: "actual_volatility".into(),
            features: vec!["rci".into(), "flat".into()],
            n_train: 3,
            train_mae: Some(0.01),
            estimator: Estimator::Ridge(model),
        }
    }

    #[test]
    fn zero_std_column_has_zero_importance() {
        let artifact = ridge_artifact();
        let Estimator::Ridge(model) = &artifact.estimator else {
            panic!("expected ridge");
        };
        let rows = coef_importance(model, &artifact.features);
        let flat = rows.iter().find(|r| r.0 == "flat").unwrap();
        assert_eq!(flat.3, 0.0);
        assert!(rows.iter().all(|r| r.3.is_finite()));
        assert_eq!(rows[0].0, "rci");
    }

    #[test]
    fn degraded_bundle_writes_zero_summary_and_coefficients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.json");
        let artifact = ridge_artifact();
        let report = save_bundle(
            &path,
            &artifact,
            &Explanation::Degraded {
                reason: "test".into(),
            },
        )
        .unwrap();

        assert!(!report.explanation_computed);
        assert!(report.shap_values_path.is_none());
        assert_eq!(report.digest.len(), 64);
        let summary = std::fs::read_to_string(dir.path().join("vol_shap_summary.csv")).unwrap();
        assert!(summary.starts_with("feature,mean_abs_shap\n"));
        assert!(summary.contains("rci,0\n"));
        assert!(dir.path().join("shap_summary.csv").exists());
        assert!(dir.path().join("vol_coef_summary.csv").exists());

        let loaded = ModelArtifact::load(&path).unwrap();
        assert_eq!(loaded.features, artifact.features);
        assert_eq!(loaded.tier(), ModelTier::Ridge);
    }
}
