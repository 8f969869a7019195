use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use volai::config::{NotifierConfig, SchedulerConfig, TrainerConfig};
use volai::error::AppError;
use volai::notifier::Notifier;
use volai::registry::{path_string, ModelRegistry};
use volai::scheduler::{RetrainIfNeeded, RunRequest, Scheduler, TriggerReason, NO_TRAINING_DATA_NOTE};
use volai::store::default_model::get_default_model;
use volai::store::model_eval::recent_evals;
use volai::store::model_meta::{upsert_meta, MetaUpdate};
use volai::store::prediction_log::{insert_prediction, NewPredictionLog};
use volai::store::Store;

struct Fixture {
    _dir: tempfile::TempDir,
    store: Store,
    registry: ModelRegistry,
    scheduler: Scheduler,
    base_model: String,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("db.sqlite"));
    store.init().unwrap();
    let registry = ModelRegistry::new(dir.path().join("models"));
    registry.ensure_dir().unwrap();
    let base = registry.dir().join("vol_model.json");
    std::fs::write(&base, "{}").unwrap();

    let scheduler = Scheduler::new(
        store.clone(),
        registry.clone(),
        TrainerConfig::default(),
        SchedulerConfig::default(),
        Arc::new(Notifier::from_config(NotifierConfig::default())),
    );
    Fixture {
        base_model: path_string(&base),
        _dir: dir,
        store,
        registry,
        scheduler,
    }
}

/// `10 + extra` labeled rows attributed to `model_path`. The first ten carry
/// a stored abs_error of 0.02, the rest are off by 0.015 and need deriving.
fn seed_logs(store: &Store, model_path: &str, extra: usize) {
    let start = Utc.with_ymd_and_hms(2025, 9, 1, 9, 0, 0).unwrap();
    for i in 0..(10 + extra) {
        let rci = (i % 10) as f64;
        let atr = ((i * 7) % 13) as f64;
        let vix = 12.0 + (i % 5) as f64;
        let actual = 0.1 + 0.02 * rci + 0.005 * atr;

        let mut log = NewPredictionLog::new(start + Duration::hours(6 * i as i64));
        log.model_path = Some(model_path.to_string());
        log.actual_volatility = Some(actual);
        if i < 10 {
            log.predicted_volatility = Some(actual + 0.02);
            log.abs_error = Some(0.02);
        } else {
            log.predicted_volatility = Some(actual + 0.015);
        }
        log.features.insert("rci".into(), rci);
        log.features.insert("atr".into(), atr);
        log.features.insert("vix".into(), vix);
        insert_prediction(store, &log).unwrap();
    }
}

fn threshold_request(auto_promote: bool) -> RunRequest {
    RunRequest {
        mae_threshold: Some(0.01),
        auto_promote,
        ..RunRequest::default()
    }
}

#[tokio::test]
/// A model whose recent MAE exceeds the threshold is retrained, the new
/// artifact is promoted, and both default pointers follow it.
async fn threshold_breach_retrains_and_promotes() {
    let fx = fixture();
    seed_logs(&fx.store, &fx.base_model, 40);

    let result = fx.scheduler.run(threshold_request(true)).await.unwrap();

    assert_eq!(result.checked_models.len(), 1);
    assert_eq!(result.triggered.len(), 1);
    let triggered = &result.triggered[0];
    assert_eq!(triggered.base_model, fx.base_model);
    assert_eq!(triggered.reason, TriggerReason::Threshold);
    assert_eq!(triggered.old_n, 50);
    assert!((triggered.old_mae.unwrap() - 0.016).abs() < 1e-9);
    assert!(triggered.promoted);
    assert_eq!(triggered.pointer_file_synced, Some(true));

    let new_path = triggered.new_model_path.clone().unwrap();
    assert!(Path::new(&new_path).is_file());
    assert!(new_path.contains("vol_model_auto_"));
    assert_eq!(fx.registry.read_pointer_file().unwrap(), Some(new_path.clone()));
    assert_eq!(
        get_default_model(&fx.store).unwrap().unwrap().model_path,
        new_path
    );

    let audit = recent_evals(&fx.store, 10).unwrap();
    assert_eq!(audit.len(), 1);
    assert!(audit[0].promoted);
    assert_eq!(audit[0].run_id.as_deref(), Some(result.run_id.as_str()));
    assert_eq!(audit[0].triggered_by.as_deref(), Some("threshold"));
    assert_eq!(audit[0].new_model_path.as_deref(), Some(new_path.as_str()));

    // Nothing configured, so every channel is skipped.
    let report = result.notification.unwrap();
    assert!(!report.ok_any);
    assert_eq!(report.channels.len(), 3);
}

#[tokio::test]
/// Without auto-promotion the retrained artifact exists but neither pointer
/// moves, and the audit row records an unpromoted retrain.
async fn retrain_without_auto_promote_leaves_default_alone() {
    let fx = fixture();
    seed_logs(&fx.store, &fx.base_model, 40);

    let result = fx.scheduler.run(threshold_request(false)).await.unwrap();

    assert_eq!(result.triggered.len(), 1);
    let triggered = &result.triggered[0];
    assert!(!triggered.promoted);
    assert!(triggered.new_model_path.is_some());
    assert!(triggered.pointer_file_synced.is_none());
    assert!(result.notification.is_none());
    assert!(fx.registry.read_pointer_file().unwrap().is_none());
    assert!(get_default_model(&fx.store).unwrap().is_none());

    let audit = recent_evals(&fx.store, 10).unwrap();
    assert_eq!(audit.len(), 1);
    assert!(!audit[0].promoted);
    assert!(audit[0].new_model_path.is_some());
}

#[tokio::test]
/// One model's retrain failing does not undo or hide an earlier promotion in
/// the same batch: the failure is audited and the run still reports and
/// notifies.
async fn failed_retrain_does_not_abort_the_batch() {
    let fx = fixture();
    let other = fx.registry.dir().join("z_model.json");
    std::fs::write(&other, "{}").unwrap();
    let other = path_string(&other);
    seed_logs(&fx.store, &fx.base_model, 40);
    seed_logs(&fx.store, &other, 0);

    // Directories squatting on every auto path the second model could pick
    // make its artifact unwritable.
    let now = Utc::now();
    for secs in -5..600 {
        let blocked = fx.registry.new_auto_path(&other, now + Duration::seconds(secs));
        std::fs::create_dir_all(blocked).unwrap();
    }

    let result = fx.scheduler.run(threshold_request(true)).await.unwrap();

    assert_eq!(result.checked_models.len(), 2);
    assert_eq!(result.triggered.len(), 2);
    let first = &result.triggered[0];
    assert_eq!(first.base_model, fx.base_model);
    assert!(first.promoted);
    let promoted_path = first.new_model_path.clone().unwrap();

    let failed = &result.triggered[1];
    assert_eq!(failed.base_model, other);
    assert!(!failed.promoted);
    assert!(failed.new_model_path.is_none());
    assert!(failed.note.as_deref().unwrap().contains("persist"));

    assert_eq!(
        get_default_model(&fx.store).unwrap().unwrap().model_path,
        promoted_path
    );
    assert!(result.notification.is_some());

    let audit = recent_evals(&fx.store, 10).unwrap();
    assert_eq!(audit.len(), 2);
    let failed_row = audit.iter().find(|r| r.model_path == other).unwrap();
    assert!(!failed_row.promoted);
    assert!(failed_row.new_model_path.is_none());
    assert!(failed_row.note.as_deref().unwrap().contains("persist"));
    assert!(audit.iter().any(|r| r.model_path == fx.base_model && r.promoted));
}

#[tokio::test]
/// Models under the threshold and below the label count are only checked.
async fn healthy_model_is_not_triggered() {
    let fx = fixture();
    seed_logs(&fx.store, &fx.base_model, 0);

    let req = RunRequest {
        mae_threshold: Some(0.5),
        min_new_labels: Some(100),
        ..RunRequest::default()
    };
    let result = fx.scheduler.run(req).await.unwrap();

    assert_eq!(result.checked_models.len(), 1);
    assert_eq!(result.checked_models[0].n, 10);
    assert!(result.triggered.is_empty());
    assert!(recent_evals(&fx.store, 10).unwrap().is_empty());
}

#[tokio::test]
/// A count trigger with no labeled rows at all still audits the decision
/// and finishes the batch without an error.
async fn count_trigger_without_training_data_is_audited() {
    let fx = fixture();

    let req = RunRequest {
        min_new_labels: Some(0),
        ..RunRequest::default()
    };
    let result = fx.scheduler.run(req).await.unwrap();

    assert_eq!(result.triggered.len(), 1);
    let triggered = &result.triggered[0];
    assert_eq!(triggered.reason, TriggerReason::Count);
    assert!(!triggered.promoted);
    assert!(triggered.new_model_path.is_none());
    assert_eq!(triggered.note.as_deref(), Some(NO_TRAINING_DATA_NOTE));

    let audit = recent_evals(&fx.store, 10).unwrap();
    assert_eq!(audit.len(), 1);
    assert!(!audit[0].promoted);
    assert_eq!(audit[0].note.as_deref(), Some(NO_TRAINING_DATA_NOTE));
    assert_eq!(audit[0].triggered_by.as_deref(), Some("count"));
}

#[tokio::test]
/// Negative thresholds are rejected before any work happens.
async fn negative_threshold_is_a_bad_request() {
    let fx = fixture();
    let req = RunRequest {
        mae_threshold: Some(-0.1),
        ..RunRequest::default()
    };
    let err = fx.scheduler.run(req).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
/// Single-model jobs fall back to the pinned model and refuse to guess when
/// nothing is pinned.
async fn single_model_jobs_use_the_pinned_model() {
    let fx = fixture();
    seed_logs(&fx.store, &fx.base_model, 0);

    let err = fx.scheduler.eval_now(None).await.unwrap_err();
    assert!(matches!(err, AppError::DataUnavailable(_)));

    upsert_meta(
        &fx.store,
        &MetaUpdate {
            model_path: fx.base_model.clone(),
            pinned: Some(true),
            ..MetaUpdate::default()
        },
    )
    .unwrap();

    let eval = fx.scheduler.eval_now(None).await.unwrap();
    assert_eq!(eval.model_path, fx.base_model);
    assert_eq!(eval.n, 10);

    let dry = fx.scheduler.retrain_dryrun(None).await.unwrap();
    assert!(!dry.would_retrain);
    assert!((dry.threshold - 0.05).abs() < 1e-12);
}

#[tokio::test]
/// retrain-if-needed skips under the threshold and overwrites the artifact
/// in place above it.
async fn retrain_if_needed_respects_threshold() {
    let fx = fixture();
    seed_logs(&fx.store, &fx.base_model, 20);

    let skipped = fx
        .scheduler
        .retrain_if_needed(Some(fx.base_model.clone()), Some(0.05))
        .await
        .unwrap();
    assert!(matches!(skipped, RetrainIfNeeded::Skipped { .. }));

    let retrained = fx
        .scheduler
        .retrain_if_needed(Some(fx.base_model.clone()), Some(0.01))
        .await
        .unwrap();
    match retrained {
        RetrainIfNeeded::Retrained {
            model_path,
            mae_before,
            ..
        } => {
            assert_eq!(model_path, fx.base_model);
            assert!(mae_before > 0.015 && mae_before < 0.02);
        }
        other => panic!("expected a retrain, got {:?}", other),
    }

    let on_disk = std::fs::read_to_string(&fx.base_model).unwrap();
    assert!(on_disk.contains("\"features\""));
    let audit = recent_evals(&fx.store, 10).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].note.as_deref(), Some("retrained in place"));
}

#[tokio::test]
/// A manual retrain writes a sibling artifact; promoting it moves the
/// default and records a promoted audit row.
async fn manual_retrain_then_promote() {
    let fx = fixture();
    seed_logs(&fx.store, &fx.base_model, 10);

    let manual = fx
        .scheduler
        .retrain_run(Some(fx.base_model.clone()))
        .await
        .unwrap();
    assert_eq!(manual.n_train, 20);
    assert!(!manual.features.is_empty());
    assert!(Path::new(&manual.new_model_path).is_file());
    assert!(fx.registry.read_pointer_file().unwrap().is_none());

    let promotion = fx
        .scheduler
        .retrain_promote(manual.new_model_path.clone())
        .await
        .unwrap();
    assert_eq!(promotion.model_path, manual.new_model_path);
    assert!(promotion.pointer_file_synced);
    assert!(promotion.digest.is_some());
    assert_eq!(
        fx.registry.read_pointer_file().unwrap(),
        Some(manual.new_model_path.clone())
    );

    let audit = fx.scheduler.status(None).await.unwrap();
    assert_eq!(audit.len(), 2);
    assert!(audit.iter().any(|r| r.promoted));
    assert!(audit.iter().all(|r| r.triggered_by.as_deref() == Some("manual")));
}

#[tokio::test]
/// Promoting a file that does not exist is a 404, not a silent pointer move.
async fn promote_unknown_model_is_not_found() {
    let fx = fixture();
    let err = fx
        .scheduler
        .retrain_promote("models/missing.json".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(get_default_model(&fx.store).unwrap().is_none());
}
