//! HTTP surface: scheduler jobs, model management and prediction logging.

pub mod models;
pub mod predictions;
pub mod scheduler;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::AppError;
use crate::notifier::Notifier;
use crate::registry::ModelRegistry;
use crate::scheduler::Scheduler;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub registry: ModelRegistry,
    pub scheduler: Scheduler,
}

impl AppState {
    pub fn from_config(config: Config) -> Self {
        let store = Store::new(&config.storage.database_path);
        let registry = ModelRegistry::new(&config.storage.models_dir);
        let notifier = Arc::new(Notifier::from_config(config.notifier.clone()));
        let scheduler = Scheduler::new(
            store.clone(),
            registry.clone(),
            config.trainer.clone(),
            config.scheduler.clone(),
            notifier,
        );
        Self {
            config: Arc::new(config),
            store,
            registry,
            scheduler,
        }
    }
}

/// Run synchronous store/filesystem work off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(e.into()))?
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/scheduler/health", get(scheduler::health))
        .route("/scheduler/status", get(scheduler::status))
        .route("/scheduler/run", post(scheduler::run))
        .route("/scheduler/eval-now", post(scheduler::eval_now))
        .route("/scheduler/retrain-if-needed", post(scheduler::retrain_if_needed))
        .route("/scheduler/retrain/dryrun", post(scheduler::retrain_dryrun))
        .route("/scheduler/retrain/run", post(scheduler::retrain_run))
        .route("/scheduler/retrain/promote", post(scheduler::retrain_promote))
        .route("/models", get(models::list).delete(models::delete))
        .route("/models/default", get(models::get_default).post(models::set_default))
        .route("/models/meta", get(models::get_meta).post(models::update_meta))
        .route("/predictions", post(predictions::predict))
        .route("/predictions/labels", post(predictions::fill_labels))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
