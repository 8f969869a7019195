use std::cmp::Ordering;

use super::dataset::Dataset;

/// Pearson correlation over pairs where `x` is observed. `None` when fewer
/// than two pairs remain or either side has zero variance.
pub fn pearson(x: &[Option<f64>], y: &[f64]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .filter_map(|(a, b)| a.map(|a| (a, *b)))
        .collect();
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(a, _)| a).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, b)| b).sum::<f64>() / n;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in &pairs {
        let dx = a - mean_x;
        let dy = b - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= f64::EPSILON || syy <= f64::EPSILON {
        return None;
    }
    let r = sxy / (sxx.sqrt() * syy.sqrt());
    r.is_finite().then_some(r)
}

/// Candidate names by descending |r|. Undefined correlations go last; the
/// sort is stable so ties keep column order.
pub fn rank_by_abs_correlation(ds: &Dataset) -> Vec<(String, Option<f64>)> {
    let mut ranked: Vec<(String, Option<f64>)> = ds
        .features
        .iter()
        .zip(&ds.columns)
        .map(|(name, col)| (name.clone(), pearson(col, &ds.label).map(f64::abs)))
        .collect();
    ranked.sort_by(|a, b| match (a.1, b.1) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    ranked
}

/// Top `max(1, top_k)` candidates by correlation, then forced names that
/// exist, deduplicated in first-seen order and cut back to the same size.
/// A forced name outside the top slice is therefore dropped.
pub fn select_top_features(ds: &Dataset, top_k: usize, ensure_include: &[String]) -> Vec<String> {
    let k = top_k.max(1);
    let mut selected: Vec<String> = rank_by_abs_correlation(ds)
        .into_iter()
        .map(|(name, _)| name)
        .take(k)
        .collect();
    for name in ensure_include {
        if ds.features.contains(name) && !selected.contains(name) {
            selected.push(name.clone());
        }
    }
    selected.truncate(k);
    selected
}
