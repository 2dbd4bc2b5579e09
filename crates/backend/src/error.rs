use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tts_engine::TtsEngineError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("TTS service not available")]
    Unavailable,
    #[error("{0}")]
    Validation(String),
    #[error("failed to load model {model}: {reason}")]
    ModelLoad { model: String, reason: String },
    #[error("failed to synthesize speech: {0}")]
    Synthesis(String),
    #[error("cleanup failed: {0}")]
    Cleanup(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation(message.into())
    }

    /// Engine errors raised while rendering.
    pub fn from_render(err: TtsEngineError) -> Self {
        match err {
            TtsEngineError::Unavailable(_) => ServiceError::Unavailable,
            TtsEngineError::ModelLoad { model, reason } => ServiceError::ModelLoad { model, reason },
            other => ServiceError::Synthesis(other.to_string()),
        }
    }

    /// Engine errors raised while constructing a model.
    pub fn from_load(model: &str, err: TtsEngineError) -> Self {
        match err {
            TtsEngineError::Unavailable(_) => ServiceError::Unavailable,
            TtsEngineError::ModelLoad { model, reason } => ServiceError::ModelLoad { model, reason },
            other => ServiceError::ModelLoad {
                model: model.to_string(),
                reason: other.to_string(),
            },
        }
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            ServiceError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::ModelLoad { .. }
            | ServiceError::Synthesis(_)
            | ServiceError::Cleanup(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            ServiceError::Unavailable => "Service Unavailable",
            ServiceError::Validation(_) => "Validation Error",
            ServiceError::ModelLoad { .. } => "Model Load Error",
            ServiceError::Synthesis(_) => "Synthesis Error",
            ServiceError::Cleanup(_) => "Cleanup Error",
            ServiceError::NotFound(_) => "Not Found",
            ServiceError::Internal(_) => "Internal Server Error",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: &'static str,
    details: String,
}

/// HTTP rendering of a [`ServiceError`].
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        let details = match self.0 {
            // Internal details stay in the logs.
            ServiceError::Internal(ref err) => {
                tracing::error!(target = "tts_gateway::api", %err, "internal error");
                "An unexpected error occurred".to_string()
            }
            ref other => other.to_string(),
        };
        let body = ErrorBody {
            success: false,
            error: self.0.kind(),
            details,
        };
        (status, Json(body)).into_response()
    }
}
