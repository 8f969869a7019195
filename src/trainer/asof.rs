//! Date-keyed left join of macro indicators onto training rows.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::store::RawTable;

use super::dataset::parse_date;

/// Suffix for macro columns whose name already exists on the left side.
pub const MACRO_SUFFIX: &str = "_m";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinMethod {
    /// Most recent macro date on or before the row date.
    #[default]
    Asof,
    /// Closest macro date in either direction; ties resolve to the past.
    Nearest,
    /// Same calendar date only.
    Exact,
}

/// Macro table sorted by date with invalid dates dropped.
#[derive(Debug, Clone, Default)]
pub struct MacroSeries {
    dates: Vec<NaiveDate>,
    columns: Vec<(String, Vec<Option<f64>>)>,
}

impl MacroSeries {
    pub fn from_raw(table: &RawTable) -> Self {
        let Some(date_idx) = table.column_index("date") else {
            return Self::default();
        };
        let mut keyed: Vec<(NaiveDate, usize)> = table
            .rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| parse_date(&row[date_idx]).map(|d| (d, i)))
            .collect();
        keyed.sort_by_key(|(d, _)| *d);
        keyed.dedup_by_key(|(d, _)| *d);

        let columns = table
            .columns
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != date_idx)
            .map(|(ci, name)| {
                let values = keyed
                    .iter()
                    .map(|(_, ri)| table.rows[*ri][ci].as_f64())
                    .collect();
                (name.clone(), values)
            })
            .collect();
        Self {
            dates: keyed.into_iter().map(|(d, _)| d).collect(),
            columns,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty() || self.columns.is_empty()
    }

    fn match_index(&self, day: NaiveDate, method: JoinMethod, max_lag_days: Option<i64>) -> Option<usize> {
        let within = |idx: usize| {
            let lag = (day - self.dates[idx]).num_days().abs();
            max_lag_days.map_or(true, |max| lag <= max)
        };
        match method {
            JoinMethod::Exact => self.dates.binary_search(&day).ok(),
            JoinMethod::Asof => {
                let upto = self.dates.partition_point(|d| *d <= day);
                let idx = upto.checked_sub(1)?;
                within(idx).then_some(idx)
            }
            JoinMethod::Nearest => {
                let after = self.dates.partition_point(|d| *d < day);
                let before = after.checked_sub(1);
                let forward = (after < self.dates.len()).then_some(after);
                let idx = match (before, forward) {
                    (Some(b), Some(f)) => {
                        let lag_b = (day - self.dates[b]).num_days().abs();
                        let lag_f = (self.dates[f] - day).num_days().abs();
                        if lag_f < lag_b {
                            f
                        } else {
                            b
                        }
                    }
                    (Some(b), None) => b,
                    (None, Some(f)) => f,
                    (None, None) => return None,
                };
                within(idx).then_some(idx)
            }
        }
    }
}

/// New columns to append to the left side, one value per left row. Rows
/// without a date, or whose best match lies beyond `max_lag_days`, get
/// `None` in every macro column.
pub fn attach_macro_features(
    left_dates: &[Option<NaiveDate>],
    existing_columns: &[String],
    series: &MacroSeries,
    method: JoinMethod,
    max_lag_days: Option<i64>,
) -> Vec<(String, Vec<Option<f64>>)> {
    if series.is_empty() || left_dates.iter().all(Option::is_none) {
        return Vec::new();
    }

    let matches: Vec<Option<usize>> = left_dates
        .iter()
        .map(|d| d.and_then(|day| series.match_index(day, method, max_lag_days)))
        .collect();

    let mut out: Vec<(String, Vec<Option<f64>>)> = Vec::with_capacity(series.columns.len());
    for (name, values) in &series.columns {
        let mut out_name = name.clone();
        if existing_columns.iter().any(|c| c == name) {
            out_name = format!("{}{}", name, MACRO_SUFFIX);
        }
        if existing_columns.iter().any(|c| *c == out_name) || out.iter().any(|(n, _)| *n == out_name) {
            continue;
        }
        let joined = matches
            .iter()
            .map(|m| m.and_then(|idx| values[idx]))
            .collect();
        out.push((out_name, joined));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RawValue;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, day).unwrap()
    }

    fn series() -> MacroSeries {
        MacroSeries::from_raw(&RawTable {
            columns: vec!["date".into(), "vix".into(), "dxy".into()],
            rows: vec![
                vec![RawValue::Text("2025-09-22".into()), RawValue::Real(17.0), RawValue::Real(101.0)],
                vec![RawValue::Text("2025-09-15".into()), RawValue::Real(15.0), RawValue::Null],
                vec![RawValue::Text("garbage".into()), RawValue::Real(99.0), RawValue::Real(99.0)],
            ],
        })
    }

    #[test]
    fn asof_picks_past_and_nulls_stale_matches() {
        let left = vec![Some(d(16)), Some(d(23)), Some(d(20)), None, Some(d(10))];
        let cols = attach_macro_features(&left, &["rci".into()], &series(), JoinMethod::Asof, Some(3));
        let vix = &cols.iter().find(|(n, _)| n == "vix").unwrap().1;
        assert_eq!(vix, &vec![Some(15.0), Some(17.0), None, None, None]);
    }

    #[test]
    fn nearest_looks_forward_and_suffixes_collisions() {
        let left = vec![Some(d(20)), Some(d(17))];
        let cols = attach_macro_features(&left, &["vix".into()], &series(), JoinMethod::Nearest, Some(3));
        let names: Vec<&str> = cols.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["vix_m", "dxy"]);
        assert_eq!(cols[0].1, vec![Some(17.0), Some(15.0)]);
    }

    #[test]
    fn exact_requires_same_day() {
        let left = vec![Some(d(22)), Some(d(21))];
        let cols = attach_macro_features(&left, &[], &series(), JoinMethod::Exact, None);
        assert_eq!(cols[0].1, vec![Some(17.0), None]);
    }

    #[test]
    fn unbounded_lag_always_matches_past() {
        let left = vec![Some(d(30))];
        let cols = attach_macro_features(&left, &[], &series(), JoinMethod::Asof, None);
        assert_eq!(cols[0].1, vec![Some(17.0)]);
    }
}
