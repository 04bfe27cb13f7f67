//! Error codes and JSON error responses for the admin API

use crate::model::ModelError;
use crate::registry::RegistryError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for admin API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminErrorCode {
    /// Missing or invalid credentials
    Unauthorized,
    /// Credentials lack the required capability
    Forbidden,
    /// Request body could not be parsed or a field is missing
    BadRequest,
    /// Node id already registered
    DuplicateNode,
    /// Domain + path already routed
    DuplicateEntryPoint,
    /// Referenced node does not exist
    UnknownNode,
    /// Field value rejected by validation
    InvalidValue,
    /// Proxy configuration could not be written
    RenderFailed,
    /// State could not be persisted or the registry is read-only
    PersistenceFailed,
    /// Change saved but the proxy did not reload
    ReloadFailed,
    /// No such route
    NotFound,
}

impl AdminErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdminErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminErrorCode::Forbidden => StatusCode::FORBIDDEN,
            AdminErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            AdminErrorCode::DuplicateNode => StatusCode::CONFLICT,
            AdminErrorCode::DuplicateEntryPoint => StatusCode::CONFLICT,
            AdminErrorCode::UnknownNode => StatusCode::NOT_FOUND,
            AdminErrorCode::InvalidValue => StatusCode::UNPROCESSABLE_ENTITY,
            AdminErrorCode::RenderFailed => StatusCode::INTERNAL_SERVER_ERROR,
            AdminErrorCode::PersistenceFailed => StatusCode::SERVICE_UNAVAILABLE,
            AdminErrorCode::ReloadFailed => StatusCode::BAD_GATEWAY,
            AdminErrorCode::NotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Value for the X-Registry-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            AdminErrorCode::Unauthorized => "UNAUTHORIZED",
            AdminErrorCode::Forbidden => "FORBIDDEN",
            AdminErrorCode::BadRequest => "BAD_REQUEST",
            AdminErrorCode::DuplicateNode => "DUPLICATE_NODE",
            AdminErrorCode::DuplicateEntryPoint => "DUPLICATE_ENTRY_POINT",
            AdminErrorCode::UnknownNode => "UNKNOWN_NODE",
            AdminErrorCode::InvalidValue => "INVALID_VALUE",
            AdminErrorCode::RenderFailed => "RENDER_FAILED",
            AdminErrorCode::PersistenceFailed => "PERSISTENCE_FAILED",
            AdminErrorCode::ReloadFailed => "RELOAD_FAILED",
            AdminErrorCode::NotFound => "NOT_FOUND",
        }
    }
}

impl From<&RegistryError> for AdminErrorCode {
    fn from(err: &RegistryError) -> Self {
        match err {
            RegistryError::Validation(e) => match e {
                ModelError::DuplicateNodeId(_) => AdminErrorCode::DuplicateNode,
                ModelError::DuplicateEntryPoint { .. } => AdminErrorCode::DuplicateEntryPoint,
                ModelError::UnknownNodeId(_) | ModelError::NodeNotFound(_) => AdminErrorCode::UnknownNode,
                ModelError::MissingEndpoint(_)
                | ModelError::EndpointIndexOutOfRange { .. }
                | ModelError::InvalidNodeId { .. }
                | ModelError::ReservedNodeId(_)
                | ModelError::InvalidValue { .. } => AdminErrorCode::InvalidValue,
            },
            RegistryError::Render(_) => AdminErrorCode::RenderFailed,
            RegistryError::Persist(_) | RegistryError::Degraded => AdminErrorCode::PersistenceFailed,
            RegistryError::Reload(_) => AdminErrorCode::ReloadFailed,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: AdminErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: AdminErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with an X-Registry-Error header
pub fn json_error_response(code: AdminErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header("content-type", "application/json")
        .header("X-Registry-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

/// Map a registry failure to its JSON error response
pub fn registry_error_response(err: &RegistryError) -> Response<Full<Bytes>> {
    json_error_response(AdminErrorCode::from(err), err.to_string())
}
