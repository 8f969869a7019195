use serde::{Deserialize, Serialize};

use crate::error::TrainError;

pub const RIDGE_ALPHA: f64 = 1.0;

/// L2-regularized linear regression with an unpenalized intercept. Missing
/// inputs are replaced by the per-column training median.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RidgeModel {
    pub alpha: f64,
    pub intercept: f64,
    pub coef: Vec<f64>,
    pub medians: Vec<f64>,
    /// Column means of the imputed training matrix.
    pub means: Vec<f64>,
    /// Population std of the imputed training matrix.
    pub stds: Vec<f64>,
}

pub fn median(values: &[Option<f64>]) -> f64 {
    let mut observed: Vec<f64> = values.iter().flatten().copied().collect();
    if observed.is_empty() {
        return 0.0;
    }
    observed.sort_by(f64::total_cmp);
    let mid = observed.len() / 2;
    if observed.len() % 2 == 0 {
        (observed[mid - 1] + observed[mid]) / 2.0
    } else {
        observed[mid]
    }
}

pub fn impute(row: &[Option<f64>], medians: &[f64]) -> Vec<f64> {
    row.iter()
        .zip(medians)
        .map(|(v, m)| v.unwrap_or(*m))
        .collect()
}

/// Solve `a x = b` in place by Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

impl RidgeModel {
    /// `rows` is row-major, one `Option` per feature.
    pub fn fit(rows: &[Vec<Option<f64>>], y: &[f64], alpha: f64) -> Result<Self, TrainError> {
        let n = rows.len();
        if n == 0 || n != y.len() {
            return Err(TrainError::Fit(format!(
                "ridge needs matching non-empty inputs, got {} rows and {} labels",
                n,
                y.len()
            )));
        }
        let m = rows[0].len();

        let medians: Vec<f64> = (0..m)
            .map(|j| median(&rows.iter().map(|r| r[j]).collect::<Vec<_>>()))
            .collect();
        let x: Vec<Vec<f64>> = rows.iter().map(|r| impute(r, &medians)).collect();

        let nf = n as f64;
        let means: Vec<f64> = (0..m)
            .map(|j| x.iter().map(|r| r[j]).sum::<f64>() / nf)
            .collect();
        let stds: Vec<f64> = (0..m)
            .map(|j| {
                let var = x.iter().map(|r| (r[j] - means[j]).powi(2)).sum::<f64>() / nf;
                var.sqrt()
            })
            .collect();
        let y_mean = y.iter().sum::<f64>() / nf;

        let mut gram = vec![vec![0.0; m]; m];
        let mut rhs = vec![0.0; m];
        for (r, target) in x.iter().zip(y) {
            let yc = target - y_mean;
            for i in 0..m {
                let xi = r[i] - means[i];
                rhs[i] += xi * yc;
                for j in i..m {
                    gram[i][j] += xi * (r[j] - means[j]);
                }
            }
        }
        for i in 0..m {
            for j in 0..i {
                gram[i][j] = gram[j][i];
            }
            gram[i][i] += alpha;
        }

        let coef = solve(gram, rhs)
            .ok_or_else(|| TrainError::Fit("ridge normal equations are singular".to_string()))?;
        let intercept = y_mean - coef.iter().zip(&means).map(|(c, mu)| c * mu).sum::<f64>();

        Ok(Self {
            alpha,
            intercept,
            coef,
            medians,
            means,
            stds,
        })
    }

    pub fn predict(&self, row: &[Option<f64>]) -> f64 {
        impute(row, &self.medians)
            .iter()
            .zip(&self.coef)
            .map(|(x, c)| x * c)
            .sum::<f64>()
            + self.intercept
    }

    /// Exact Shapley values of a linear model with independent inputs.
    pub fn contributions(&self, row: &[Option<f64>]) -> Vec<f64> {
        impute(row, &self.medians)
            .iter()
            .zip(self.coef.iter().zip(&self.means))
            .map(|(x, (c, mu))| c * (x - mu))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_handles_even_and_empty() {
        assert_eq!(median(&[Some(3.0), None, Some(1.0), Some(2.0), Some(10.0)]), 2.5);
        assert_eq!(median(&[None, None]), 0.0);
    }

    #[test]
    fn zero_alpha_recovers_exact_line() {
        let rows: Vec<Vec<Option<f64>>> = (0..6).map(|i| vec![Some(i as f64)]).collect();
        let y: Vec<f64> = (0..6).map(|i| 2.0 * i as f64 + 1.0).collect();
        let model = RidgeModel::fit(&rows, &y, 0.0).unwrap();
        assert!((model.coef[0] - 2.0).abs() < 1e-9);
        assert!((model.intercept - 1.0).abs() < 1e-9);
        assert!((model.predict(&[Some(10.0)]) - 21.0).abs() < 1e-9);
    }

    #[test]
    fn penalty_shrinks_and_missing_uses_median() {
        let rows: Vec<Vec<Option<f64>>> = vec![
            vec![Some(0.0), Some(1.0)],
            vec![Some(1.0), None],
            vec![Some(2.0), Some(1.0)],
            vec![Some(3.0), Some(1.0)],
        ];
        let y = vec![0.0, 1.0, 2.0, 3.0];
        let model = RidgeModel::fit(&rows, &y, RIDGE_ALPHA).unwrap();
        assert!(model.coef[0] > 0.0 && model.coef[0] < 1.0);
        assert_eq!(model.medians[1], 1.0);
        assert_eq!(model.stds[1], 0.0);
        assert_eq!(model.predict(&[Some(2.0), None]), model.predict(&[Some(2.0), Some(1.0)]));
    }

    #[test]
    fn contributions_sum_to_prediction_minus_baseline() {
        let rows: Vec<Vec<Option<f64>>> = vec![
            vec![Some(1.0), Some(4.0)],
            vec![Some(2.0), Some(1.0)],
            vec![Some(3.0), Some(3.0)],
        ];
        let y = vec![1.0, 2.5, 2.0];
        let model = RidgeModel::fit(&rows, &y, RIDGE_ALPHA).unwrap();
        let baseline = model.intercept
            + model.coef.iter().zip(&model.means).map(|(c, m)| c * m).sum::<f64>();
        let row = [Some(5.0), Some(0.0)];
        let phi: f64 = model.contributions(&row).iter().sum();
        assert!((model.predict(&row) - baseline - phi).abs() < 1e-9);
    }
}
