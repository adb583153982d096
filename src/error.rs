use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{api::ErrorResponse, store::StoreError};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    /// Client input error; nothing was mutated.
    #[error("Missing {0}")]
    MissingParameter(&'static str),
    #[error("{0}")]
    NotFound(String),
    /// The in-memory state that triggered the write is kept.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("Notification error: {0}")]
    Notification(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::MissingParameter(_) => "MissingParameter",
            AppError::NotFound(_) => "NotFound",
            AppError::Persistence(_) => "PersistenceError",
            AppError::Notification(_) => "NotificationError",
            AppError::Internal(_) => "InternalError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Persistence(_) | AppError::Notification(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub(crate) fn actor_gone(actor: &str) -> Self {
        AppError::Internal(format!("{actor} actor is not running"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse::new(self.kind(), &self.to_string()));
        (self.status(), body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
