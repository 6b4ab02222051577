//! Uniform API response envelope and error mapping.
//!
//! Every `/api` response is `{success, data?, error?, code?, timestamp}` with
//! a stable `code` string mirrored from the core error taxonomy.

use crate::error::CoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub timestamp: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
            timestamp: Utc::now().to_rfc3339(),
        })
    }
}

/// Handler-side failure carrying the status and envelope fields.
#[derive(Debug)]
pub struct ApiFailure {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiFailure {
    pub fn forbidden(role: &str) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "forbidden".to_string(),
            message: format!("role '{role}' may not perform this operation"),
        }
    }
}

impl From<CoreError> for ApiFailure {
    fn from(e: CoreError) -> Self {
        Self {
            status: e.status(),
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let body: ApiResponse<()> = ApiResponse {
            success: false,
            data: None,
            error: Some(self.message),
            code: Some(self.code),
            timestamp: Utc::now().to_rfc3339(),
        };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_becomes_409_envelope() {
        let failure: ApiFailure = CoreError::conflict("would go negative").into();
        assert_eq!(failure.status, StatusCode::CONFLICT);
        assert_eq!(failure.code, "inventory_conflict");
    }

    #[test]
    fn ok_envelope_shape() {
        let Json(body) = ApiResponse::ok(serde_json::json!({"x": 1}));
        assert!(body.success);
        assert!(body.error.is_none());
        assert!(!body.timestamp.is_empty());
    }
}
