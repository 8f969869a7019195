//! Per-row feature attribution.
//!
//! Linear models use the closed form `coef * (x - mean)`. Boosted trees use
//! exact path-dependent Shapley values over the trees of the LightGBM dump,
//! enumerating subsets of the features each tree actually splits on and
//! marginalizing the rest by node cover.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use serde::Serialize;

use crate::error::TrainError;

use super::estimator::Estimator;
use super::gbdt::{Node, Tree};

pub const SAMPLE_SEED: u64 = 42;
/// Subset enumeration is exponential in the features a single tree uses.
pub const MAX_TREE_FEATURES: usize = 16;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Explanation {
    Computed {
        features: Vec<String>,
        base_value: f64,
        values: Vec<Vec<f64>>,
    },
    Degraded {
        reason: String,
    },
}

impl Explanation {
    pub fn is_computed(&self) -> bool {
        matches!(self, Self::Computed { .. })
    }

    /// Mean |attribution| per feature, descending. A degraded explanation
    /// reports every feature at zero.
    pub fn mean_abs(&self, features: &[String]) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = match self {
            Self::Computed { values, .. } if !values.is_empty() => features
                .iter()
                .enumerate()
                .map(|(j, name)| {
                    let total: f64 = values.iter().map(|row| row[j].abs()).sum();
                    (name.clone(), total / values.len() as f64)
                })
                .collect(),
            _ => features.iter().map(|f| (f.clone(), 0.0)).collect(),
        };
        out.sort_by(|a, b| b.1.total_cmp(&a.1));
        out
    }
}

/// Row indices to explain: all rows when they fit, else a seeded sample in
/// ascending order.
pub fn sample_indices(n_rows: usize, sample_size: usize) -> Vec<usize> {
    if n_rows <= sample_size {
        return (0..n_rows).collect();
    }
    let mut rng = StdRng::seed_from_u64(SAMPLE_SEED);
    let mut picked = sample(&mut rng, n_rows, sample_size).into_vec();
    picked.sort_unstable();
    picked
}

/// Expected tree output with the features in `mask` fixed to `row` and the
/// rest averaged over training cover.
fn conditional_value(nodes: &[Node], idx: usize, row: &[Option<f64>], used: &[usize], mask: u32) -> f64 {
    match &nodes[idx] {
        Node::Leaf { value, .. } => *value,
        Node::Split(split) => {
            let known = used
                .binary_search(&split.feature)
                .map(|bit| mask & (1 << bit) != 0)
                .unwrap_or(false);
            if known {
                let next = if split.goes_left(row) {
                    split.left
                } else {
                    split.right
                };
                return conditional_value(nodes, next, row, used, mask);
            }
            let lc = nodes[split.left].cover();
            let rc = nodes[split.right].cover();
            let total = if split.cover > 0.0 { split.cover } else { lc + rc };
            if total <= 0.0 {
                return 0.5
                    * (conditional_value(nodes, split.left, row, used, mask)
                        + conditional_value(nodes, split.right, row, used, mask));
            }
            (lc * conditional_value(nodes, split.left, row, used, mask)
                + rc * conditional_value(nodes, split.right, row, used, mask))
                / total
        }
    }
}

fn factorials(n: usize) -> Vec<f64> {
    let mut out = vec![1.0; n + 1];
    for i in 1..=n {
        out[i] = out[i - 1] * i as f64;
    }
    out
}

/// Tree output averaged over training cover with no input known.
fn expected_value(tree: &Tree) -> f64 {
    conditional_value(&tree.nodes, 0, &[], &[], 0)
}

/// Adds this tree's Shapley values for `row` into `phi`.
fn tree_shap(tree: &Tree, row: &[Option<f64>], phi: &mut [f64]) -> Result<(), TrainError> {
    let used = tree.used_features();
    let u = used.len();
    if u > MAX_TREE_FEATURES {
        return Err(TrainError::Fit(format!(
            "tree splits on {} features, exact attribution supports at most {}",
            u, MAX_TREE_FEATURES
        )));
    }
    let values: Vec<f64> = (0..1u32 << u)
        .map(|mask| conditional_value(&tree.nodes, 0, row, &used, mask))
        .collect();
    let fact = factorials(u);

    for (bit, &feature) in used.iter().enumerate() {
        let Some(slot) = phi.get_mut(feature) else {
            return Err(TrainError::Fit(format!(
                "tree references feature {} beyond the model's inputs",
                feature
            )));
        };
        let flag = 1u32 << bit;
        let mut contribution = 0.0;
        for mask in 0..1u32 << u {
            if mask & flag != 0 {
                continue;
            }
            let s = mask.count_ones() as usize;
            let weight = fact[s] * fact[u - s - 1] / fact[u];
            contribution += weight * (values[(mask | flag) as usize] - values[mask as usize]);
        }
        *slot += contribution;
    }
    Ok(())
}

/// Attribution for each row plus the shared base value, so that
/// `base + sum(phi) == predict(row)`.
pub fn shapley_values(
    estimator: &Estimator,
    n_features: usize,
    rows: &[Vec<Option<f64>>],
) -> Result<(f64, Vec<Vec<f64>>), TrainError> {
    if let Some(bad) = rows.iter().find(|r| r.len() != n_features) {
        return Err(TrainError::Fit(format!(
            "row has {} inputs, model expects {}",
            bad.len(),
            n_features
        )));
    }
    match estimator {
        Estimator::Mean { value } => Ok((*value, vec![vec![0.0; n_features]; rows.len()])),
        Estimator::Ridge(model) => {
            let base = model.intercept
                + model
                    .coef
                    .iter()
                    .zip(&model.means)
                    .map(|(c, mu)| c * mu)
                    .sum::<f64>();
            Ok((base, rows.iter().map(|r| model.contributions(r)).collect()))
        }
        Estimator::Gbdt(model) => {
            let trees = model.trees()?;
            let base: f64 = trees.iter().map(expected_value).sum();
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let mut phi = vec![0.0; n_features];
                for tree in &trees {
                    tree_shap(tree, row, &mut phi)?;
                }
                out.push(phi);
            }
            Ok((base, out))
        }
    }
}

/// Explain a bounded sample. Failures degrade instead of propagating.
pub fn explain_sample(
    estimator: &Estimator,
    features: &[String],
    rows: &[Vec<Option<f64>>],
    sample_size: usize,
) -> Explanation {
    let picked: Vec<Vec<Option<f64>>> = sample_indices(rows.len(), sample_size)
        .into_iter()
        .map(|i| rows[i].clone())
        .collect();
    match shapley_values(estimator, features.len(), &picked) {
        Ok((base_value, values)) if values.iter().flatten().all(|v| v.is_finite()) => {
            Explanation::Computed {
                features: features.to_vec(),
                base_value,
                values,
            }
        }
        Ok(_) => {
            tracing::warn!("attribution produced non-finite values");
            Explanation::Degraded {
                reason: "non-finite attribution values".to_string(),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "attribution failed");
            Explanation::Degraded {
                reason: e.to_string(),
            }
        }
    }
}
