use anyhow::{bail, Result};
use chrono::NaiveDate;
use rusqlite::{params_from_iter, types::Value};

use super::raw::{read_table, RawTable};
use super::Store;

/// Indicator columns of the `macro_features` table, besides `date`.
pub const MACRO_COLUMNS: [&str; 5] = ["vix", "us10y_yield", "gold_change", "dxy", "cpi_yoy"];

/// Insert or overwrite the indicators for one date. Columns not named keep
/// their previous value.
pub fn upsert_macro_row(store: &Store, date: NaiveDate, values: &[(&str, f64)]) -> Result<()> {
    for (name, _) in values {
        if !MACRO_COLUMNS.contains(name) {
            bail!("unknown macro column '{}'", name);
        }
    }

    let mut columns = vec!["date"];
    let mut bound: Vec<Value> = vec![date.format("%Y-%m-%d").to_string().into()];
    for (name, value) in values {
        columns.push(*name);
        bound.push((*value).into());
    }
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = values
        .iter()
        .map(|(name, _)| format!("{0} = excluded.{0}", name))
        .collect::<Vec<_>>();
    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    let sql = format!(
        "INSERT INTO macro_features ({}) VALUES ({}) ON CONFLICT(date) {}",
        columns.join(", "),
        placeholders,
        conflict
    );

    let conn = store.open()?;
    conn.execute(&sql, params_from_iter(bound))?;
    Ok(())
}

pub fn load_macro_table(store: &Store) -> Result<RawTable> {
    let conn = store.open()?;
    read_table(&conn, "SELECT * FROM macro_features ORDER BY date ASC", [])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_keeps_unnamed_columns() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("db.sqlite"));
        let d = NaiveDate::from_ymd_opt(2025, 9, 19).unwrap();
        upsert_macro_row(&store, d, &[("vix", 15.0), ("dxy", 101.0)]).unwrap();
        upsert_macro_row(&store, d, &[("vix", 16.5)]).unwrap();

        let table = load_macro_table(&store).unwrap();
        assert_eq!(table.len(), 1);
        let vix = table.column("vix").unwrap();
        let dxy = table.column("dxy").unwrap();
        assert_eq!(vix[0].as_f64(), Some(16.5));
        assert_eq!(dxy[0].as_f64(), Some(101.0));
        assert!(upsert_macro_row(&store, d, &[("bogus", 1.0)]).is_err());
    }
}
