//! Core error taxonomy.
//!
//! Every fallible core operation returns `CoreError`. Each variant carries a
//! stable `code()` string that API clients can branch on, and maps to exactly
//! one HTTP status. Provider failures stay internal to the pairing/weather
//! pipelines; only chain exhaustion surfaces.

use axum::http::StatusCode;
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("inventory conflict: {0}")]
    InventoryConflict(String),

    /// op_id already applied. Treated as success at the sync boundary.
    #[error("duplicate operation: {0}")]
    SyncDuplicate(String),

    #[error("provider timed out: {0}")]
    ProviderTimeout(String),

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("all pairing providers exhausted")]
    PairingFailed,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("connection capacity exceeded")]
    CapacityExceeded,

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl CoreError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::InventoryConflict(msg.into())
    }

    /// Stable machine-readable code for API responses and per-op outcomes.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidArgument(_) => "invalid_argument",
            CoreError::NotFound(_) => "not_found",
            CoreError::InventoryConflict(_) => "inventory_conflict",
            CoreError::SyncDuplicate(_) => "sync_duplicate",
            CoreError::ProviderTimeout(_) => "provider_timeout",
            CoreError::ProviderError(_) => "provider_error",
            CoreError::PairingFailed => "pairing_failed",
            CoreError::Storage(_) => "storage",
            CoreError::CapacityExceeded => "capacity_exceeded",
            CoreError::Cancelled(_) => "cancelled",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InventoryConflict(_) => StatusCode::CONFLICT,
            CoreError::SyncDuplicate(_) => StatusCode::OK,
            CoreError::ProviderTimeout(_) | CoreError::ProviderError(_) => {
                StatusCode::BAD_GATEWAY
            }
            CoreError::PairingFailed => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, msg) => {
                // Constraint violations are invariant breaks, not storage faults.
                // Upper layers map them to 409 instead of 500.
                if inner.code == rusqlite::ErrorCode::ConstraintViolation {
                    CoreError::InventoryConflict(
                        msg.clone().unwrap_or_else(|| "constraint violation".into()),
                    )
                } else {
                    CoreError::Storage(e.to_string())
                }
            }
            _ => CoreError::Storage(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::InvalidArgument(format!("malformed json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::invalid("x").code(), "invalid_argument");
        assert_eq!(CoreError::conflict("x").code(), "inventory_conflict");
        assert_eq!(CoreError::PairingFailed.code(), "pairing_failed");
    }

    #[test]
    fn conflict_maps_to_409() {
        assert_eq!(
            CoreError::conflict("would go negative").status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn constraint_violation_becomes_conflict() {
        let e = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("CHECK constraint failed: stock".to_string()),
        );
        let core: CoreError = e.into();
        assert_eq!(core.code(), "inventory_conflict");
    }
}
