use chrono::{Duration, NaiveDate, TimeZone, Utc};

use volai::config::TrainerConfig;
use volai::error::TrainError;
use volai::store::macro_features::upsert_macro_row;
use volai::store::prediction_log::{insert_prediction, NewPredictionLog};
use volai::store::Store;
use volai::trainer::asof::JoinMethod;
use volai::trainer::estimator::ModelTier;
use volai::trainer::persist::ModelArtifact;
use volai::trainer::{recompute_explanation, AutoTrainer};

fn seed(store: &Store, n: usize) {
    let start = Utc.with_ymd_and_hms(2025, 9, 1, 9, 0, 0).unwrap();
    for i in 0..n {
        let rci = (i % 10) as f64;
        let atr = ((i * 3) % 7) as f64;
        let mut log = NewPredictionLog::new(start + Duration::days(i as i64));
        log.actual_volatility = Some(0.1 + 0.02 * rci + 0.001 * atr);
        log.features.insert("rci".into(), rci);
        log.features.insert("atr".into(), atr);
        log.features.insert("vix".into(), 15.0 + ((i * 5) % 11) as f64);
        log.features.insert("volume_rate".into(), 1.0 + ((i * 2) % 5) as f64);
        insert_prediction(store, &log).unwrap();
    }
}

fn train(n: usize) -> (tempfile::TempDir, volai::trainer::TrainOutcome) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("db.sqlite"));
    seed(&store, n);
    let mut trainer = AutoTrainer::new(TrainerConfig::default(), dir.path().join("m.json"));
    let outcome = trainer.run(&store, 3, &[]).unwrap();
    (dir, outcome)
}

#[test]
/// Model capacity grows with the number of labeled rows.
fn tier_follows_row_count() {
    let (_d, small) = train(8);
    assert_eq!(small.tier, ModelTier::Ridge);
    assert_eq!(small.n_train, 8);
    assert!(small.report.coef_summary_path.is_some());

    let (_d, large) = train(60);
    assert_eq!(large.tier, ModelTier::Gbdt);
    assert!(large.report.coef_summary_path.is_none());
    assert!(large.train_mae.unwrap() < small.train_mae.unwrap() + 0.05);
}

#[test]
/// A single labeled row is not enough to fit anything.
fn one_row_is_insufficient() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("db.sqlite"));
    seed(&store, 1);
    let mut trainer = AutoTrainer::new(TrainerConfig::default(), dir.path().join("m.json"));
    let err = trainer.run(&store, 3, &[]).unwrap_err();
    assert!(matches!(err, TrainError::InsufficientRows(1)));
    assert!(err.is_data_unavailable());
}

#[test]
/// Top-k keeps the strongest correlates; forced columns only survive when
/// there is room left under k.
fn top_k_selection_with_forced_feature() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("db.sqlite"));
    seed(&store, 20);
    let mut trainer = AutoTrainer::new(TrainerConfig::default(), dir.path().join("m.json"));
    trainer.load_data(&store).unwrap();

    let top = trainer.filter_top_features(1, &[]).unwrap().to_vec();
    assert_eq!(top, vec!["rci".to_string()]);

    let cut = trainer
        .filter_top_features(1, &["volume_rate".to_string()])
        .unwrap()
        .to_vec();
    assert_eq!(cut, vec!["rci".to_string()]);

    let wide = trainer
        .filter_top_features(10, &["volume_rate".to_string(), "rci".to_string()])
        .unwrap()
        .to_vec();
    assert_eq!(wide[0], "rci");
    assert!(wide.contains(&"volume_rate".to_string()));
    let mut distinct = wide.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), wide.len());
}

#[test]
/// Macro indicators are joined by date; a name clash with a log column gets
/// the macro suffix.
fn macro_indicators_join_by_date() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("db.sqlite"));
    seed(&store, 10);
    for day in 0..10 {
        let date = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap() + Duration::days(day);
        upsert_macro_row(
            &store,
            date,
            &[("dxy", 100.0 + day as f64), ("vix", 20.0 - day as f64)],
        )
        .unwrap();
    }

    let cfg = TrainerConfig {
        macro_join: JoinMethod::Asof,
        ..TrainerConfig::default()
    };
    let mut trainer = AutoTrainer::new(cfg, dir.path().join("m.json"));
    let ds = trainer.load_data(&store).unwrap();
    assert!(ds.features.contains(&"dxy".to_string()));
    assert!(ds.features.contains(&"vix_m".to_string()));
    let dxy = ds.column("dxy").unwrap();
    assert_eq!(dxy[0], Some(100.0));
    assert_eq!(dxy[9], Some(109.0));
}

#[test]
/// The saved artifact reloads and predicts from named features, and its
/// explanation can be rebuilt against current data.
fn saved_artifact_reloads_and_recomputes() {
    let (dir, outcome) = train(12);
    let path = dir.path().join("m.json");
    let artifact = ModelArtifact::load(&path).unwrap();
    assert_eq!(artifact.features, outcome.features);
    assert_eq!(artifact.tier(), ModelTier::Ridge);

    let pred = artifact
        .predict_named(|name| match name {
            "rci" => Some(5.0),
            _ => None,
        })
        .unwrap();
    assert!(pred.is_finite());

    let store = Store::new(dir.path().join("db.sqlite"));
    let explanation = recompute_explanation(&store, &path, &TrainerConfig::default()).unwrap();
    assert!(explanation.is_computed());
    assert!(std::path::Path::new(&outcome.report.shap_summary_path).is_file());
    assert!(std::path::Path::new(&outcome.report.compat_summary_path).is_file());
}
