use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display};

/// Error envelope returned by every HTTP endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Structured error kind the workflow UI branches on
    pub kind: ErrorKind,
    /// Human-readable error description
    pub message: String,
    /// Machine-readable details (e.g. the list of unmet preconditions)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// RFC 3339 timestamp when the error was rendered
    pub timestamp: String,
}

/// Transport-neutral error taxonomy.
///
/// Business-rule kinds are expected outcomes a caller can act on; `Storage`
/// and `Internal` are fatal and never share a kind with a business rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    InvalidStateTransition,
    CardinalityMismatch,
    AlreadyBound,
    AlreadyAssigned,
    ChemistryMismatch,
    Immutable,
    PreconditionFailed,
    Validation,
    Unauthenticated,
    Conflict,
    Storage,
    Internal,
}

impl ErrorKind {
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::Storage | ErrorKind::Internal)
    }
}

/// One pack-level precondition that blocks `mark_ready_for_eol` or dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "precondition", rename_all = "snake_case")]
pub enum UnmetPrecondition {
    ModuleCount { expected: u32, actual: u32 },
    PackSerialUnassigned,
    QcNotPassed { current: String },
    BmsUnbound,
}

impl fmt::Display for UnmetPrecondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModuleCount { expected, actual } => {
                write!(f, "module count {} of {} required", actual, expected)
            }
            Self::PackSerialUnassigned => write!(f, "pack serial not assigned"),
            Self::QcNotPassed { current } => write!(f, "QC status is {}, not PASSED", current),
            Self::BmsUnbound => write!(f, "BMS identity not bound"),
        }
    }
}

fn join_unmet(unmet: &[UnmetPrecondition]) -> String {
    unmet
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: cluster '{cluster}' may not {verb} on {screen}")]
    PermissionDenied {
        cluster: String,
        screen: String,
        verb: String,
    },

    #[error("Invalid state transition: cannot {operation} {entity} while {status}")]
    InvalidStateTransition {
        entity: String,
        status: String,
        operation: String,
    },

    #[error("Cardinality mismatch on {subject}: expected {expected}, actual {actual}")]
    CardinalityMismatch {
        subject: String,
        expected: u32,
        actual: u32,
    },

    #[error("Already bound: {0}")]
    AlreadyBound(String),

    #[error("Already assigned: {0}")]
    AlreadyAssigned(String),

    #[error(
        "Chemistry mismatch: lot {lot_id} is {lot_chemistry}, blueprint {blueprint_id} requires {blueprint_chemistry}"
    )]
    ChemistryMismatch {
        lot_id: String,
        lot_chemistry: String,
        blueprint_id: String,
        blueprint_chemistry: String,
    },

    #[error("Blueprint mismatch: {0}")]
    BlueprintMismatch(String),

    #[error("Immutable: {0}")]
    Immutable(String),

    #[error("Preconditions unmet: {}", join_unmet(.0))]
    PreconditionsUnmet(Vec<UnmetPrecondition>),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    pub fn invalid_transition(
        entity: impl fmt::Display,
        status: impl fmt::Display,
        operation: &str,
    ) -> Self {
        ServiceError::InvalidStateTransition {
            entity: entity.to_string(),
            status: status.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn cardinality(subject: impl fmt::Display, expected: u32, actual: u32) -> Self {
        ServiceError::CardinalityMismatch {
            subject: subject.to_string(),
            expected,
            actual,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            Self::CardinalityMismatch { .. } => ErrorKind::CardinalityMismatch,
            Self::AlreadyBound(_) => ErrorKind::AlreadyBound,
            Self::AlreadyAssigned(_) => ErrorKind::AlreadyAssigned,
            Self::ChemistryMismatch { .. } => ErrorKind::ChemistryMismatch,
            Self::Immutable(_) => ErrorKind::Immutable,
            Self::PreconditionsUnmet(_) => ErrorKind::PreconditionFailed,
            Self::BlueprintMismatch(_) | Self::ValidationError(_) | Self::InvalidInput(_) => {
                ErrorKind::Validation
            }
            Self::Unauthorized(_) => ErrorKind::Unauthenticated,
            Self::ConcurrentModification(_) => ErrorKind::Conflict,
            Self::StorageError(_) => ErrorKind::Storage,
            Self::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// Signed shortfall for cardinality errors (positive = missing children).
    pub fn shortfall(&self) -> Option<i64> {
        match self {
            Self::CardinalityMismatch {
                expected, actual, ..
            } => Some(i64::from(*expected) - i64::from(*actual)),
            _ => None,
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::InvalidStateTransition
            | ErrorKind::AlreadyBound
            | ErrorKind::AlreadyAssigned
            | ErrorKind::Immutable
            | ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::CardinalityMismatch
            | ErrorKind::ChemistryMismatch
            | ErrorKind::PreconditionFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Storage => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Fatal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::StorageError(_) => "Persistence unavailable".to_string(),
            Self::InternalError(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::PreconditionsUnmet(unmet) => serde_json::to_value(unmet).ok(),
            Self::CardinalityMismatch {
                expected, actual, ..
            } => Some(serde_json::json!({
                "expected": expected,
                "actual": actual,
                "shortfall": i64::from(*expected) - i64::from(*actual),
            })),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            kind: self.kind(),
            message: self.response_message(),
            details: self.details(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
