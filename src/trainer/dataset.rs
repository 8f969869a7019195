//! Turning raw `prediction_logs` rows into a numeric training table.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::error::TrainError;
use crate::store::{RawTable, RawValue};

use super::asof::{attach_macro_features, JoinMethod, MacroSeries};

/// Columns that would leak the target or identify the model.
pub const LEAK_COLUMNS: [&str; 3] = ["predicted_volatility", "abs_error", "model_path"];
/// Identifier columns that carry no signal.
pub const META_COLUMNS: [&str; 4] = ["id", "user_id", "uid", "email"];
/// Where a row date is looked for when no `date` column exists, in order.
pub const DATE_CANDIDATES: [&str; 7] = [
    "logged_at",
    "created_at",
    "ran_at",
    "ts",
    "timestamp",
    "time",
    "datetime",
];

pub fn parse_date(value: &RawValue) -> Option<NaiveDate> {
    match value {
        RawValue::Text(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.naive_utc().date());
            }
            for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(dt.date());
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
        }
        RawValue::Integer(secs) => DateTime::from_timestamp(*secs, 0).map(|dt| dt.date_naive()),
        _ => None,
    }
}

/// The row date, taken from `date` if present, else from the first
/// candidate column holding at least one parseable value.
pub fn infer_dates(table: &RawTable) -> Option<(String, Vec<Option<NaiveDate>>)> {
    if let Some(values) = table.column("date") {
        return Some(("date".to_string(), values.into_iter().map(parse_date).collect()));
    }
    for name in DATE_CANDIDATES {
        let Some(values) = table.column(name) else {
            continue;
        };
        let parsed: Vec<Option<NaiveDate>> = values.into_iter().map(parse_date).collect();
        if parsed.iter().any(Option::is_some) {
            return Some((name.to_string(), parsed));
        }
    }
    None
}

/// Numeric training table: candidate feature columns plus a non-null label.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub label_col: String,
    pub features: Vec<String>,
    pub columns: Vec<Vec<Option<f64>>>,
    pub label: Vec<f64>,
    pub dates: Option<Vec<Option<NaiveDate>>>,
}

impl Dataset {
    pub fn n_rows(&self) -> usize {
        self.label.len()
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        let idx = self.features.iter().position(|f| f == name)?;
        Some(&self.columns[idx])
    }

    /// Row-major view over the named features, in the given order.
    pub fn rows_for(&self, features: &[String]) -> Vec<Vec<Option<f64>>> {
        let cols: Vec<&[Option<f64>]> = features
            .iter()
            .map(|f| self.column(f).unwrap_or(&[]))
            .collect();
        (0..self.n_rows())
            .map(|r| cols.iter().map(|c| c.get(r).copied().flatten()).collect())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions<'a> {
    pub label_col: &'a str,
    pub initial_features: &'a [String],
    pub macro_join: JoinMethod,
    pub max_lag_days: Option<i64>,
}

fn observed(values: &[Option<f64>]) -> usize {
    values.iter().filter(|v| v.is_some()).count()
}

/// Build the training table from labeled log rows and (optionally) the macro
/// table. Rows are dropped only when their label is missing.
pub fn build_dataset(
    table: &RawTable,
    macro_table: Option<&RawTable>,
    opts: &BuildOptions<'_>,
) -> Result<Dataset, TrainError> {
    if table.is_empty() {
        return Err(TrainError::NoTrainingData);
    }
    let Some(label_idx) = table.column_index(opts.label_col) else {
        return Err(TrainError::MissingLabel(opts.label_col.to_string()));
    };

    let dates = infer_dates(table);
    let date_source = dates.as_ref().map(|(name, _)| name.clone());

    let mut numeric: Vec<(String, Vec<Option<f64>>)> = Vec::new();
    for (ci, name) in table.columns.iter().enumerate() {
        if ci == label_idx
            || name == "date"
            || date_source.as_deref() == Some(name.as_str())
            || LEAK_COLUMNS.contains(&name.as_str())
        {
            continue;
        }
        let values = table.rows.iter().map(|row| row[ci].as_f64()).collect();
        numeric.push((name.clone(), values));
    }

    if let (Some((_, row_dates)), Some(macro_raw)) = (&dates, macro_table) {
        let series = MacroSeries::from_raw(macro_raw);
        let existing: Vec<String> = table.columns.clone();
        let joined = attach_macro_features(
            row_dates,
            &existing,
            &series,
            opts.macro_join,
            opts.max_lag_days,
        );
        if !joined.is_empty() {
            tracing::debug!(columns = joined.len(), method = ?opts.macro_join, "joined macro features");
        }
        numeric.extend(joined);
    }

    let label_raw: Vec<Option<f64>> = table.rows.iter().map(|row| row[label_idx].as_f64()).collect();

    let mut candidates: Vec<(String, Vec<Option<f64>>)> = numeric
        .iter()
        .filter(|(name, values)| !META_COLUMNS.contains(&name.as_str()) && observed(values) >= 2)
        .cloned()
        .collect();
    if candidates.is_empty() {
        candidates = opts
            .initial_features
            .iter()
            .filter_map(|f| numeric.iter().find(|(name, _)| name == f))
            .filter(|(_, values)| observed(values) >= 2)
            .cloned()
            .collect();
    }
    if candidates.is_empty() {
        return Err(TrainError::NoCandidateFeatures);
    }

    let keep: Vec<usize> = label_raw
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|_| i))
        .collect();
    if keep.len() < 2 {
        return Err(TrainError::InsufficientRows(keep.len()));
    }

    let label = keep.iter().filter_map(|&i| label_raw[i]).collect();
    let (features, columns) = candidates
        .into_iter()
        .map(|(name, values)| (name, keep.iter().map(|&i| values[i]).collect()))
        .unzip();
    let dates = dates.map(|(_, all)| keep.iter().map(|&i| all[i]).collect());

    Ok(Dataset {
        label_col: opts.label_col.to_string(),
        features,
        columns,
        label,
        dates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(features: &[String]) -> BuildOptions<'_> {
        BuildOptions {
            label_col: "actual_volatility",
            initial_features: features,
            macro_join: JoinMethod::Asof,
            max_lag_days: Some(3),
        }
    }

    fn table() -> RawTable {
        RawTable {
            columns: vec![
                "id".into(),
                "created_at".into(),
                "rci".into(),
                "sector".into(),
                "predicted_volatility".into(),
                "actual_volatility".into(),
                "sparse".into(),
            ],
            rows: vec![
                vec![
                    RawValue::Integer(1),
                    RawValue::Text("2025-09-16T10:00:00.000000Z".into()),
                    RawValue::Real(1.0),
                    RawValue::Text("tech".into()),
                    RawValue::Real(0.2),
                    RawValue::Real(0.1),
                    RawValue::Real(7.0),
                ],
                vec![
                    RawValue::Integer(2),
                    RawValue::Text("2025-09-17T10:00:00.000000Z".into()),
                    RawValue::Text("2.5".into()),
                    RawValue::Text("energy".into()),
                    RawValue::Real(0.2),
                    RawValue::Text("n/a".into()),
                    RawValue::Null,
                ],
                vec![
                    RawValue::Integer(3),
                    RawValue::Text("2025-09-18T10:00:00.000000Z".into()),
                    RawValue::Null,
                    RawValue::Null,
                    RawValue::Real(0.2),
                    RawValue::Real(0.3),
                    RawValue::Null,
                ],
                vec![
                    RawValue::Integer(4),
                    RawValue::Text("2025-09-19T10:00:00.000000Z".into()),
                    RawValue::Real(4.0),
                    RawValue::Null,
                    RawValue::Real(0.2),
                    RawValue::Real(0.4),
                    RawValue::Null,
                ],
            ],
        }
    }

    #[test]
    fn drops_leaks_meta_and_sparse_columns_but_not_rows_with_gaps() {
        let initial: Vec<String> = vec![];
        let ds = build_dataset(&table(), None, &opts(&initial)).unwrap();
        assert_eq!(ds.features, vec!["rci"]);
        assert_eq!(ds.n_rows(), 3);
        assert_eq!(ds.column("rci").unwrap(), &[Some(1.0), None, Some(4.0)]);
        assert_eq!(ds.label, vec![0.1, 0.3, 0.4]);
        let dates = ds.dates.unwrap();
        assert_eq!(dates[0], NaiveDate::from_ymd_opt(2025, 9, 16));
    }

    #[test]
    fn empty_table_is_no_training_data() {
        let initial: Vec<String> = vec![];
        let empty = RawTable {
            columns: vec!["actual_volatility".into()],
            rows: vec![],
        };
        assert!(matches!(
            build_dataset(&empty, None, &opts(&initial)),
            Err(TrainError::NoTrainingData)
        ));
    }

    #[test]
    fn single_usable_row_is_insufficient() {
        let initial: Vec<String> = vec![];
        let mut t = table();
        t.rows.truncate(2);
        assert!(matches!(
            build_dataset(&t, None, &opts(&initial)),
            Err(TrainError::InsufficientRows(1))
        ));
    }

    #[test]
    fn macro_columns_join_by_inferred_date() {
        let initial: Vec<String> = vec![];
        let macro_table = RawTable {
            columns: vec!["date".into(), "vix".into()],
            rows: vec![
                vec![RawValue::Text("2025-09-15".into()), RawValue::Real(14.0)],
                vec![RawValue::Text("2025-09-18".into()), RawValue::Real(18.0)],
            ],
        };
        let ds = build_dataset(&table(), Some(&macro_table), &opts(&initial)).unwrap();
        assert!(ds.features.contains(&"vix".to_string()));
        assert_eq!(ds.column("vix").unwrap(), &[Some(14.0), Some(18.0), Some(18.0)]);
    }

    #[test]
    fn date_parsing_accepts_common_shapes() {
        let want = NaiveDate::from_ymd_opt(2025, 9, 20);
        assert_eq!(parse_date(&RawValue::Text("2025-09-20".into())), want);
        assert_eq!(parse_date(&RawValue::Text("2025-09-20 13:45:00".into())), want);
        assert_eq!(parse_date(&RawValue::Text("2025-09-20T13:45:00+00:00".into())), want);
        assert_eq!(parse_date(&RawValue::Text("soon".into())), None);
    }
}
