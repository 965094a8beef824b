//! Standardized error handling for API responses
//!
//! Every error leaves the API as `{success: false, error: {code, message}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::provision::ProvisionError;

/// Success envelope wrapping every data-bearing response
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// Error envelope body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
}

/// API error kinds with their status mapping
#[derive(Debug)]
pub enum ApiError {
    /// 400
    BadRequest(String),
    /// 404
    NotFound(String),
    /// 501
    NotImplemented(String),
    /// 500
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::NotImplemented(_) => "NOT_IMPLEMENTED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest(msg)
            | Self::NotFound(msg)
            | Self::NotImplemented(msg)
            | Self::Internal(msg) => msg,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.message().to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(msg) = &self {
            error!("internal API error: {}", msg);
        }
        (self.status(), Json(self.envelope())).into_response()
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::InvalidSpec(msg) => ApiError::BadRequest(msg),
            ProvisionError::NotFound(msg) => ApiError::NotFound(msg),
            ProvisionError::ProvisionerNotFound(tag) => {
                ApiError::NotFound(format!("no provisioner registered for provider '{}'", tag))
            }
            ProvisionError::NotImplemented(msg) => ApiError::NotImplemented(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("resource not found".to_string()),
            other => {
                error!("database error: {}", other);
                ApiError::Internal("database error occurred".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::NotImplemented("x".into()).status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            ApiError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_envelope_shape() {
        let envelope = ApiError::NotFound("cluster 7 not found".into()).envelope();
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("cluster 7 not found"));
    }

    #[test]
    fn test_provision_error_conversion() {
        let err: ApiError = ProvisionError::InvalidSpec("bad cidr".into()).into();
        assert_eq!(err.code(), "BAD_REQUEST");

        let err: ApiError = ProvisionError::NotImplemented("cri-o".into()).into();
        assert_eq!(err.code(), "NOT_IMPLEMENTED");

        let err: ApiError = ProvisionError::ProvisionerNotFound("k3s".into()).into();
        assert_eq!(err.code(), "NOT_FOUND");

        let err: ApiError = ProvisionError::Internal("boom".into()).into();
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_row_not_found_maps_to_404() {
        let err: ApiError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
