//! Gradient-boosted regression trees trained with LightGBM.
//!
//! The artifact keeps LightGBM's own text dump. Predictions go through the
//! native booster rebuilt from that dump; attribution walks the same trees
//! parsed back into an arena.

use std::collections::HashMap;
use std::str::FromStr;

use lightgbm3::{Booster, Dataset};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::TrainError;

const ZERO_THRESHOLD: f64 = 1e-35;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GbdtParams {
    pub n_rounds: usize,
    pub learning_rate: f64,
    pub num_leaves: usize,
    pub feature_fraction: f64,
    pub bagging_fraction: f64,
    pub bagging_freq: usize,
    pub min_data_in_leaf: usize,
    pub seed: u64,
}

impl Default for GbdtParams {
    fn default() -> Self {
        Self {
            n_rounds: 400,
            learning_rate: 0.05,
            num_leaves: 8,
            feature_fraction: 0.7,
            bagging_fraction: 0.8,
            bagging_freq: 1,
            min_data_in_leaf: 1,
            seed: 42,
        }
    }
}

impl GbdtParams {
    fn booster_params(&self) -> serde_json::Value {
        json!({
            "objective": "regression",
            "num_iterations": self.n_rounds,
            "learning_rate": self.learning_rate,
            "num_leaves": self.num_leaves,
            "feature_fraction": self.feature_fraction,
            "bagging_fraction": self.bagging_fraction,
            "bagging_freq": self.bagging_freq,
            "min_data_in_leaf": self.min_data_in_leaf,
            "seed": self.seed,
            "deterministic": true,
            "num_threads": 1,
            "verbosity": -1,
        })
    }
}

fn lgbm_err(e: lightgbm3::Error) -> TrainError {
    TrainError::Fit(format!("lightgbm: {}", e))
}

/// How a split treats a missing input, from bits 2-3 of LightGBM's
/// `decision_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingType {
    None,
    Zero,
    NaN,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub feature: usize,
    pub threshold: f64,
    pub default_left: bool,
    pub missing: MissingType,
    pub left: usize,
    pub right: usize,
    pub cover: f64,
}

impl Split {
    /// LightGBM's numerical decision, including its missing-value rules.
    pub fn goes_left(&self, row: &[Option<f64>]) -> bool {
        let mut v = row.get(self.feature).copied().flatten().unwrap_or(f64::NAN);
        if v.is_nan() && self.missing != MissingType::NaN {
            v = 0.0;
        }
        let is_missing = match self.missing {
            MissingType::None => false,
            MissingType::Zero => v.abs() <= ZERO_THRESHOLD,
            MissingType::NaN => v.is_nan(),
        };
        if is_missing {
            self.default_left
        } else {
            v <= self.threshold
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf { value: f64, cover: f64 },
    Split(Split),
}

impl Node {
    pub fn cover(&self) -> f64 {
        match self {
            Node::Leaf { cover, .. } => *cover,
            Node::Split(s) => s.cover,
        }
    }
}

/// Nodes in an arena; index 0 is the root.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

fn scalar<T>(fields: &HashMap<&str, &str>, key: &str) -> Result<T, TrainError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = fields
        .get(key)
        .ok_or_else(|| TrainError::Fit(format!("model dump is missing '{}'", key)))?;
    raw.trim()
        .parse()
        .map_err(|e| TrainError::Fit(format!("bad '{}' in model dump: {}", key, e)))
}

fn array<T>(fields: &HashMap<&str, &str>, key: &str) -> Result<Vec<T>, TrainError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = fields.get(key) else {
        return Ok(Vec::new());
    };
    raw.split_whitespace()
        .map(|token| {
            token
                .parse()
                .map_err(|e| TrainError::Fit(format!("bad '{}' value {}: {}", key, token, e)))
        })
        .collect()
}

impl Tree {
    fn from_fields(fields: &HashMap<&str, &str>) -> Result<Self, TrainError> {
        let num_leaves: usize = scalar(fields, "num_leaves")?;
        let leaf_value: Vec<f64> = array(fields, "leaf_value")?;
        let leaf_count: Vec<f64> = array(fields, "leaf_count")?;
        if num_leaves == 0 || leaf_value.len() != num_leaves {
            return Err(TrainError::Fit(format!(
                "tree declares {} leaves but carries {} values",
                num_leaves,
                leaf_value.len()
            )));
        }
        if num_leaves == 1 {
            return Ok(Self {
                nodes: vec![Node::Leaf {
                    value: leaf_value[0],
                    cover: leaf_count.first().copied().unwrap_or(0.0),
                }],
            });
        }

        let split_feature: Vec<usize> = array(fields, "split_feature")?;
        let threshold: Vec<f64> = array(fields, "threshold")?;
        let decision_type: Vec<u8> = array(fields, "decision_type")?;
        let left_child: Vec<i64> = array(fields, "left_child")?;
        let right_child: Vec<i64> = array(fields, "right_child")?;
        let internal_count: Vec<f64> = array(fields, "internal_count")?;

        let n_internal = num_leaves - 1;
        if [
            split_feature.len(),
            threshold.len(),
            decision_type.len(),
            left_child.len(),
            right_child.len(),
        ]
        .iter()
        .any(|&len| len != n_internal)
        {
            return Err(TrainError::Fit(
                "tree split arrays do not match its leaf count".to_string(),
            ));
        }

        // Internal nodes first, leaf j at n_internal + j.
        let slot = |child: i64| -> Result<usize, TrainError> {
            if child >= 0 && (child as usize) < n_internal {
                Ok(child as usize)
            } else if child < 0 && ((!child) as usize) < num_leaves {
                Ok(n_internal + (!child) as usize)
            } else {
                Err(TrainError::Fit(format!("tree child index {} out of range", child)))
            }
        };

        let mut nodes = Vec::with_capacity(n_internal + num_leaves);
        for i in 0..n_internal {
            let dt = decision_type[i];
            if dt & 1 != 0 {
                return Err(TrainError::Fit("categorical splits are not supported".to_string()));
            }
            let missing = match (dt >> 2) & 3 {
                0 => MissingType::None,
                1 => MissingType::Zero,
                2 => MissingType::NaN,
                other => {
                    return Err(TrainError::Fit(format!("unknown missing type {}", other)));
                }
            };
            nodes.push(Node::Split(Split {
                feature: split_feature[i],
                threshold: threshold[i],
                default_left: dt & 2 != 0,
                missing,
                left: slot(left_child[i])?,
                right: slot(right_child[i])?,
                cover: internal_count.get(i).copied().unwrap_or(0.0),
            }));
        }
        for (j, value) in leaf_value.into_iter().enumerate() {
            nodes.push(Node::Leaf {
                value,
                cover: leaf_count.get(j).copied().unwrap_or(0.0),
            });
        }
        Ok(Self { nodes })
    }

    pub fn predict(&self, row: &[Option<f64>]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value, .. } => return *value,
                Node::Split(split) => {
                    idx = if split.goes_left(row) {
                        split.left
                    } else {
                        split.right
                    };
                }
            }
        }
    }

    /// Distinct features this tree splits on, ascending.
    pub fn used_features(&self) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .nodes
            .iter()
            .filter_map(|n| match n {
                Node::Split(s) => Some(s.feature),
                Node::Leaf { .. } => None,
            })
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// Trees of a LightGBM text dump, in boosting order.
pub fn parse_model_text(text: &str) -> Result<Vec<Tree>, TrainError> {
    let mut trees = Vec::new();
    let mut block: Option<HashMap<&str, &str>> = None;
    for line in text.lines() {
        let line = line.trim();
        let ends_block = line.starts_with("Tree=") || line == "end of trees";
        if ends_block {
            if let Some(fields) = block.take() {
                trees.push(Tree::from_fields(&fields)?);
            }
            if line == "end of trees" {
                break;
            }
            block = Some(HashMap::new());
        } else if let Some(fields) = block.as_mut() {
            if let Some((key, value)) = line.split_once('=') {
                fields.insert(key, value);
            }
        }
    }
    if let Some(fields) = block.take() {
        trees.push(Tree::from_fields(&fields)?);
    }
    if trees.is_empty() {
        return Err(TrainError::Fit("model dump contains no trees".to_string()));
    }
    Ok(trees)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GbdtModel {
    pub params: GbdtParams,
    pub n_features: usize,
    /// LightGBM text dump of the trained booster.
    pub model_text: String,
}

fn dense(rows: &[Vec<Option<f64>>]) -> Vec<Vec<f64>> {
    rows.iter()
        .map(|r| r.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
        .collect()
}

impl GbdtModel {
    pub fn fit(x: &[Vec<Option<f64>>], y: &[f64], params: GbdtParams) -> Result<Self, TrainError> {
        let n = x.len();
        if n == 0 || n != y.len() {
            return Err(TrainError::Fit(format!(
                "gbdt needs matching non-empty inputs, got {} rows and {} labels",
                n,
                y.len()
            )));
        }
        let m = x[0].len();
        if m == 0 {
            return Err(TrainError::Fit("gbdt needs at least one feature".to_string()));
        }
        if x.iter().any(|r| r.len() != m) {
            return Err(TrainError::Fit("gbdt rows have uneven widths".to_string()));
        }

        let labels: Vec<f32> = y.iter().map(|&v| v as f32).collect();
        let dataset = Dataset::from_vec_of_vec(dense(x), labels, true).map_err(lgbm_err)?;
        let booster = Booster::train(dataset, &params.booster_params()).map_err(lgbm_err)?;
        let model_text = booster.save_string().map_err(lgbm_err)?;
        let trees = parse_model_text(&model_text)?;
        tracing::debug!(rows = n, features = m, trees = trees.len(), "lightgbm booster trained");

        Ok(Self {
            params,
            n_features: m,
            model_text,
        })
    }

    pub fn trees(&self) -> Result<Vec<Tree>, TrainError> {
        parse_model_text(&self.model_text)
    }

    pub fn predict_many(&self, rows: &[Vec<Option<f64>>]) -> Result<Vec<f64>, TrainError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(bad) = rows.iter().find(|r| r.len() != self.n_features) {
            return Err(TrainError::Fit(format!(
                "row has {} inputs, model expects {}",
                bad.len(),
                self.n_features
            )));
        }
        let booster = Booster::from_string(&self.model_text).map_err(lgbm_err)?;
        let flat: Vec<f64> = dense(rows).into_iter().flatten().collect();
        booster
            .predict_with_params(&flat, self.n_features as i32, true, "num_threads=1")
            .map_err(lgbm_err)
    }
}
