use axum::{
    Json,
    extract::rejection::QueryRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::{models::{Action, Role}, policy::HandlerKey};

/// AuthError
///
/// Every way the access pipeline can reject a request. Variants are grouped by the
/// HTTP class they surface as: authentication (401), authorization (403) and
/// configuration defects (500).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    // --- Authentication ---
    #[error("no api key provided in request headers")]
    MissingCredential,

    #[error("api key does not match any user")]
    InvalidCredential,

    // --- Authorization ---
    #[error("role {role} is not allowed to {action} on {entity}")]
    InsufficientRole {
        role: Role,
        action: Action,
        entity: String,
    },

    #[error("role {role} does not have {action} permission on {entity}")]
    ActionDenied {
        role: Role,
        action: Action,
        entity: String,
    },

    // --- Configuration / internal ---
    #[error("no route policy registered for handler {0}")]
    PolicyNotConfigured(HandlerKey),

    #[error("no permission record for role {role} and entity {entity}")]
    PermissionNotConfigured { role: Role, entity: String },

    #[error("policy enforcer ran without a resolved caller identity")]
    MissingIdentity,
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::MissingCredential | AuthError::InvalidCredential => StatusCode::UNAUTHORIZED,
            AuthError::InsufficientRole { .. } | AuthError::ActionDenied { .. } => {
                StatusCode::FORBIDDEN
            }
            AuthError::PolicyNotConfigured(_)
            | AuthError::PermissionNotConfigured { .. }
            | AuthError::MissingIdentity => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message sent to the client. Both authentication failures share one
    /// message so a caller cannot tell an unknown key from a missing one, and
    /// configuration defects are never described.
    pub fn public_message(&self) -> String {
        match self {
            AuthError::MissingCredential | AuthError::InvalidCredential => {
                "Invalid or missing api key".to_string()
            }
            AuthError::InsufficientRole { .. } | AuthError::ActionDenied { .. } => self.to_string(),
            _ => "An unexpected error occurred".to_string(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        error_response(self.status_code(), self.public_message())
    }
}

/// LookupError
///
/// Failure reported by a backing collaborator (Caller Directory, Permission Lookup,
/// catalog repository). The pipeline never forwards it to clients; it is logged and
/// re-classified.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness constraint rejected the write.
    #[error("{0}")]
    Conflict(String),
}

impl LookupError {
    /// Maps a unique-violation from Postgres to `Conflict`; anything else stays a
    /// database error.
    pub fn from_insert(err: sqlx::Error, conflict: &str) -> Self {
        match err.as_database_error() {
            Some(db) if db.is_unique_violation() => LookupError::Conflict(conflict.to_string()),
            _ => LookupError::Database(err),
        }
    }
}

/// AppError
///
/// Errors produced by the catalog handlers (books, users, permissions).
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{}", .0.join(", "))]
    Validation(Vec<String>),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Lookup(#[from] LookupError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Auth(err) => err.into_response(),
            AppError::NotFound(message) => error_response(StatusCode::NOT_FOUND, message),
            AppError::Conflict(message) => error_response(StatusCode::CONFLICT, message),
            AppError::BadRequest(message) => error_response(StatusCode::BAD_REQUEST, message),
            AppError::Lookup(LookupError::Conflict(message)) => {
                error_response(StatusCode::CONFLICT, message)
            }
            AppError::Validation(messages) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "statusCode": StatusCode::BAD_REQUEST.as_u16(),
                    "error": "Bad Request",
                    "message": messages,
                })),
            )
                .into_response(),
            AppError::Lookup(err) => {
                tracing::error!(error = %err, "backing store failure");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An unexpected error occurred".to_string(),
                )
            }
        }
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    let body = json!({
        "statusCode": status.as_u16(),
        "error": status.canonical_reason().unwrap_or("Error"),
        "message": message,
    });
    (status, Json(body)).into_response()
}
