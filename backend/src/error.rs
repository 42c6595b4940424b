//! Error handling for the allocation engine
//!
//! Provides consistent error responses in Korean and English

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Ledger errors
    #[error("Insufficient physical stock for {variant}: on hand {physical}, allocated {allocated}, change {delta}")]
    InsufficientPhysicalStock {
        variant: String,
        physical: i32,
        allocated: i32,
        delta: i32,
    },

    #[error("Insufficient available stock for {variant}: available {available}, requested {requested}")]
    InsufficientAvailableStock {
        variant: String,
        available: i32,
        requested: i32,
    },

    #[error("Ledger inconsistency for {variant}: {reason}")]
    LedgerInconsistency { variant: String, reason: String },

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    // Validation errors
    #[error("Validation error: {message}")]
    Validation {
        field: String,
        message: String,
        message_ko: String,
    },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {message}")]
    Conflict {
        resource: String,
        message: String,
        message_ko: String,
    },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(#[source] sqlx::Error),

    // Internal errors
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(field: &str, message: &str, message_ko: &str) -> Self {
        AppError::Validation {
            field: field.to_string(),
            message: message.to_string(),
            message_ko: message_ko.to_string(),
        }
    }

    /// Errors the allocator may retry
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::ConcurrentModification(_))
    }

    /// Stable machine-readable code, also used in bulk reports
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InsufficientPhysicalStock { .. } => "INSUFFICIENT_PHYSICAL_STOCK",
            AppError::InsufficientAvailableStock { .. } => "PARTIALLY_FULFILLED",
            AppError::LedgerInconsistency { .. } => "LEDGER_INCONSISTENCY",
            AppError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            AppError::Validation { .. } | AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::Conflict { .. } => "CONFLICT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            AppError::DatabaseError(_) => "DATABASE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

// Serialization failures, deadlocks and lock timeouts are retryable.
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") | Some("55P03") => {
                    return AppError::ConcurrentModification(db_err.message().to_string());
                }
                _ => {}
            }
        }
        AppError::DatabaseError(err)
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::ValidationError(errors.to_string())
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message_en: String,
    pub message_ko: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code().to_string();
        let (status, error_detail) = match &self {
            AppError::InsufficientPhysicalStock { variant, .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorDetail {
                    code,
                    message_en: self.to_string(),
                    message_ko: format!("실재고가 부족합니다: {}", variant),
                    field: None,
                },
            ),
            AppError::InsufficientAvailableStock { variant, .. } => (
                StatusCode::CONFLICT,
                ErrorDetail {
                    code,
                    message_en: format!("Order was only partially fulfilled: {}", self),
                    message_ko: format!("가용 재고가 부족하여 일부만 할당되었습니다: {}", variant),
                    field: None,
                },
            ),
            AppError::LedgerInconsistency { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail {
                    code,
                    message_en: "Stock ledger is inconsistent. Run reconciliation for this product."
                        .to_string(),
                    message_ko: "재고 원장이 일치하지 않습니다. 해당 상품의 재할당을 실행해 주세요."
                        .to_string(),
                    field: None,
                },
            ),
            AppError::ConcurrentModification(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorDetail {
                    code,
                    message_en: "Stock was modified concurrently. Please retry.".to_string(),
                    message_ko: "재고가 동시에 변경되었습니다. 다시 시도해 주세요.".to_string(),
                    field: None,
                },
            ),
            AppError::Validation {
                field,
                message,
                message_ko,
            } => (
                StatusCode::BAD_REQUEST,
                ErrorDetail {
                    code,
                    message_en: message.clone(),
                    message_ko: message_ko.clone(),
                    field: Some(field.clone()),
                },
            ),
            AppError::ValidationError(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail {
                    code,
                    message_en: msg.clone(),
                    message_ko: format!("입력값이 올바르지 않습니다: {}", msg),
                    field: None,
                },
            ),
            AppError::Conflict {
                resource,
                message,
                message_ko,
            } => (
                StatusCode::CONFLICT,
                ErrorDetail {
                    code,
                    message_en: message.clone(),
                    message_ko: message_ko.clone(),
                    field: Some(resource.clone()),
                },
            ),
            AppError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                ErrorDetail {
                    code,
                    message_en: format!("{} not found", resource),
                    message_ko: format!("{}을(를) 찾을 수 없습니다", resource),
                    field: None,
                },
            ),
            AppError::InvalidStateTransition(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorDetail {
                    code,
                    message_en: msg.clone(),
                    message_ko: format!("상태를 변경할 수 없습니다: {}", msg),
                    field: None,
                },
            ),
            AppError::DatabaseError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail {
                    code,
                    message_en: "A database error occurred".to_string(),
                    message_ko: "데이터베이스 오류가 발생했습니다".to_string(),
                    field: None,
                },
            ),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail {
                    code,
                    message_en: msg.clone(),
                    message_ko: "서버 내부 오류가 발생했습니다".to_string(),
                    field: None,
                },
            ),
        };

        // Log the error for debugging
        if status.is_server_error() {
            tracing::error!("Error: {:?}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        (status, Json(ErrorResponse { error: error_detail })).into_response()
    }
}

/// Result type alias for services and handlers
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_fulfilment_maps_to_conflict() {
        let err = AppError::InsufficientAvailableStock {
            variant: "p/-/-".to_string(),
            available: 3,
            requested: 5,
        };
        assert_eq!(err.code(), "PARTIALLY_FULFILLED");
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_ledger_inconsistency_is_server_error() {
        let err = AppError::LedgerInconsistency {
            variant: "p/-/-".to_string(),
            reason: "allocated stock 5 exceeds physical stock 3".to_string(),
        };
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_only_concurrent_modification_is_transient() {
        assert!(AppError::ConcurrentModification("lost race".to_string()).is_transient());
        assert!(!AppError::NotFound("Order".to_string()).is_transient());
    }

    #[test]
    fn test_physical_shortage_is_unprocessable() {
        let err = AppError::InsufficientPhysicalStock {
            variant: "p/-/-".to_string(),
            physical: 100,
            allocated: 0,
            delta: -150,
        };
        assert_eq!(
            err.into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
