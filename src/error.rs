use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failures raised while assembling a training set or fitting a model.
#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no labeled rows available for training")]
    NoTrainingData,

    #[error("label column '{0}' is missing from prediction_logs")]
    MissingLabel(String),

    #[error("no numeric candidate features found")]
    NoCandidateFeatures,

    #[error("insufficient training rows: {0} (need at least 2)")]
    InsufficientRows(usize),

    #[error("training data not loaded, call load_data first")]
    NotLoaded,

    #[error("model not trained")]
    NotTrained,

    #[error("model fit failed: {0}")]
    Fit(String),

    #[error("failed to persist model: {0}")]
    Persist(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl TrainError {
    /// True when the failure only means "nothing to learn from yet".
    pub fn is_data_unavailable(&self) -> bool {
        matches!(self, Self::NoTrainingData | Self::InsufficientRows(_))
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    DataUnavailable(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("training error: {0}")]
    Train(#[from] TrainError),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::DataUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Train(e) if e.is_data_unavailable() => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
