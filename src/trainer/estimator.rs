use serde::{Deserialize, Serialize};

use crate::error::TrainError;

use super::gbdt::{GbdtModel, GbdtParams};
use super::ridge::{RidgeModel, RIDGE_ALPHA};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Mean,
    Ridge,
    Gbdt,
}

impl ModelTier {
    /// Fewer than two rows can only predict the mean, fewer than
    /// `linear_fallback_n` get a ridge fit, anything larger gets trees.
    pub fn for_rows(rows: usize, linear_fallback_n: usize) -> Self {
        if rows < 2 {
            Self::Mean
        } else if rows < linear_fallback_n {
            Self::Ridge
        } else {
            Self::Gbdt
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Ridge => "ridge",
            Self::Gbdt => "gbdt",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Estimator {
    Mean { value: f64 },
    Ridge(RidgeModel),
    Gbdt(GbdtModel),
}

impl Estimator {
    pub fn fit(tier: ModelTier, x: &[Vec<Option<f64>>], y: &[f64]) -> Result<Self, TrainError> {
        match tier {
            ModelTier::Mean => {
                let value = if y.is_empty() {
                    0.0
                } else {
                    y.iter().sum::<f64>() / y.len() as f64
                };
                Ok(Self::Mean { value })
            }
            ModelTier::Ridge => Ok(Self::Ridge(RidgeModel::fit(x, y, RIDGE_ALPHA)?)),
            ModelTier::Gbdt => Ok(Self::Gbdt(GbdtModel::fit(x, y, GbdtParams::default())?)),
        }
    }

    pub fn tier(&self) -> ModelTier {
        match self {
            Self::Mean { .. } => ModelTier::Mean,
            Self::Ridge(_) => ModelTier::Ridge,
            Self::Gbdt(_) => ModelTier::Gbdt,
        }
    }

    pub fn predict_many(&self, rows: &[Vec<Option<f64>>]) -> Result<Vec<f64>, TrainError> {
        match self {
            Self::Mean { value } => Ok(vec![*value; rows.len()]),
            Self::Ridge(m) => Ok(rows.iter().map(|r| m.predict(r)).collect()),
            Self::Gbdt(m) => m.predict_many(rows),
        }
    }

    pub fn predict(&self, row: &[Option<f64>]) -> Result<f64, TrainError> {
        self.predict_many(&[row.to_vec()])?
            .first()
            .copied()
            .ok_or_else(|| TrainError::Fit("model returned no prediction".to_string()))
    }
}
