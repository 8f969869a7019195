use anyhow::Result;
use serde::Serialize;

use crate::registry::model_paths_match;
use crate::store::prediction_log::{load_labeled_outcomes, LabeledOutcome};
use crate::store::Store;

/// Error summary for one model; `mae` is `None` when nothing is labeled yet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MaeStat {
    pub mae: Option<f64>,
    pub n: usize,
}

impl MaeStat {
    pub const EMPTY: Self = Self { mae: None, n: 0 };
}

/// A stored `abs_error` wins over recomputing from the prediction.
fn row_abs_error(row: &LabeledOutcome) -> Option<f64> {
    row.abs_error
        .filter(|v| v.is_finite())
        .or_else(|| {
            row.predicted_volatility
                .map(|pred| (pred - row.actual_volatility).abs())
                .filter(|v| v.is_finite())
        })
}

pub fn mae_from_outcomes<'a, I>(rows: I, model_path: &str) -> MaeStat
where
    I: IntoIterator<Item = &'a LabeledOutcome>,
{
    let mut sum = 0.0;
    let mut n = 0usize;
    for row in rows {
        if !model_paths_match(&row.model_path, model_path) {
            continue;
        }
        if let Some(err) = row_abs_error(row) {
            sum += err;
            n += 1;
        }
    }
    if n == 0 {
        return MaeStat::EMPTY;
    }
    MaeStat {
        mae: Some(sum / n as f64),
        n,
    }
}

pub fn compute_mae_for_model(store: &Store, model_path: &str) -> Result<MaeStat> {
    let rows = load_labeled_outcomes(store)?;
    let stat = mae_from_outcomes(&rows, model_path);
    tracing::debug!(model = %model_path, mae = ?stat.mae, n = stat.n, "computed model mae");
    Ok(stat)
}
