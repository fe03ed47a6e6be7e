use crate::db::errors::DbError;
use crate::identity::IdentityError;
use crate::payment_providers::PaymentError;
use crate::types::{Operation, Permission};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Authentication required but not provided
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// User lacks required permissions for the operation
    #[error("Insufficient permissions to {action:?} {resource}")]
    InsufficientPermissions {
        required: Permission,
        action: Operation,
        resource: String,
    },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// The tenant's balance cannot cover a debit
    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: Decimal, available: Decimal },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// Conflict error, e.g., a tenant slug that is already taken
    #[error("Conflict: {message}")]
    Conflict { message: String },
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::InsufficientPermissions { .. } => StatusCode::FORBIDDEN,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Conflict { .. } => StatusCode::CONFLICT,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::InsufficientPermissions { action, resource, .. } => {
                format!("Insufficient permissions to {action} {resource}")
            }
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => {
                format!("{resource} with ID {id} not found")
            }
            Error::InsufficientCredits { required, available } => {
                format!("Insufficient credits: {required} required, {available} available")
            }
            Error::Internal { .. } => "Internal server error".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { .. } => unique_violation_details(db_err).0,
                DbError::ForeignKeyViolation { .. } => "Invalid reference to related resource".to_string(),
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
            Error::Conflict { message } => message.clone(),
        }
    }
}

/// Map a unique violation onto a user-facing message and the resource it concerns.
fn unique_violation_details(err: &DbError) -> (String, &'static str) {
    let DbError::UniqueViolation { constraint, table, .. } = err else {
        return ("Resource already exists".to_string(), "unknown");
    };
    match (table.as_deref(), constraint.as_deref()) {
        (Some("users"), Some(c)) if c.contains("email") => ("An account with this email address already exists".to_string(), "user"),
        (Some("users"), Some(c)) if c.contains("external_user_id") => {
            ("This identity is already linked to another account".to_string(), "user")
        }
        (Some("tenants"), Some(c)) if c.contains("slug") => ("This organization URL is already taken".to_string(), "tenant"),
        (Some("tenants"), Some(c)) if c.contains("identity_org_code") => {
            ("This identity organization is already linked to another tenant".to_string(), "tenant")
        }
        (Some("subscriptions"), _) => ("This organization already has a subscription".to_string(), "subscription"),
        _ => ("Resource already exists".to_string(), "unknown"),
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Database(DbError::Other(_)) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Database(_) => {
                tracing::warn!("Database constraint error: {}", self);
            }
            Error::Unauthenticated { .. } | Error::InsufficientPermissions { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::BadRequest { .. } | Error::NotFound { .. } | Error::InsufficientCredits { .. } => {
                tracing::debug!("Client error: {}", self);
            }
            Error::Conflict { .. } => {
                tracing::warn!("Conflict error: {}", self);
            }
        }

        let status = self.status_code();

        match &self {
            Error::Conflict { message } => (status, axum::response::Json(json!({ "message": message }))).into_response(),
            Error::Database(db_err @ DbError::UniqueViolation { .. }) => {
                let (message, resource) = unique_violation_details(db_err);
                let body = json!({
                    "message": message,
                    "resource": resource
                });
                (status, axum::response::Json(body)).into_response()
            }
            Error::InsufficientCredits { required, available } => {
                let body = json!({
                    "message": self.user_message(),
                    "required": required,
                    "available": available,
                });
                (status, axum::response::Json(body)).into_response()
            }
            _ => (status, self.user_message()).into_response(),
        }
    }
}

/// Convert from String errors (e.g., from external functions)
impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal { operation: msg }
    }
}

impl From<PaymentError> for Error {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Database(db) => Error::Database(db),
            PaymentError::PaymentNotCompleted => Error::BadRequest {
                message: "Payment has not been completed".to_string(),
            },
            PaymentError::InvalidData(message) => Error::BadRequest { message },
            PaymentError::InvalidSignature(_) => Error::BadRequest {
                message: "Invalid webhook signature".to_string(),
            },
            PaymentError::NoCustomerId => Error::BadRequest {
                message: "This organization has no billing account yet".to_string(),
            },
            PaymentError::ProviderApi(message) => Error::Internal {
                operation: format!("call payment provider: {message}"),
            },
        }
    }
}

impl From<IdentityError> for Error {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::NotFound(what) => Error::NotFound {
                resource: "Identity".to_string(),
                id: what,
            },
            other => Error::Internal {
                operation: format!("call identity provider: {other}"),
            },
        }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_credits_maps_to_payment_required() {
        let err = Error::InsufficientCredits {
            required: Decimal::from(10),
            available: Decimal::from(3),
        };
        assert_eq!(err.status_code(), StatusCode::PAYMENT_REQUIRED);
        assert!(err.user_message().contains("10 required"));
    }

    #[test]
    fn tenant_slug_conflict_has_friendly_message() {
        let err = Error::Database(DbError::UniqueViolation {
            constraint: Some("tenants_slug_unique".to_string()),
            table: Some("tenants".to_string()),
            message: "duplicate key".to_string(),
        });
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.user_message(), "This organization URL is already taken");
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let err = Error::Internal {
            operation: "talk to the database at 10.0.0.3".to_string(),
        };
        assert_eq!(err.user_message(), "Internal server error");
    }
}
