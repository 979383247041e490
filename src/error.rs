//! Error types for the supervisor, the registry and the admin API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors returned by [`TaskSupervisor`](crate::supervisor::TaskSupervisor) control calls
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    /// Control call made before `start_loop` or after `stop_loop`
    #[error("supervisor loop is not running")]
    LoopNotRunning,
    /// `start_loop` called on a supervisor whose loop is alive
    #[error("supervisor loop is already running")]
    LoopAlreadyRunning,
    /// The loop went away before replying
    #[error("supervisor loop exited before replying")]
    LoopGone,
}

/// Errors returned by [`ServiceRegistry`](crate::registry::ServiceRegistry) operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("service name already exists: {0}")]
    NameExists(String),
    #[error("service not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Error codes for admin API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// No service with the requested name
    UnknownService,
    /// No route for the method and path
    NotFound,
    /// The requested name is already taken
    Conflict,
    /// The service's supervisor could not process the request
    SupervisorUnavailable,
    /// Failed to render the response
    InternalError,
}

impl ApiErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::UnknownService => StatusCode::NOT_FOUND,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::Conflict => StatusCode::CONFLICT,
            ApiErrorCode::SupervisorUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Goule-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::UnknownService => "UNKNOWN_SERVICE",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::Conflict => "CONFLICT",
            ApiErrorCode::SupervisorUnavailable => "SUPERVISOR_UNAVAILABLE",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&RegistryError> for ApiErrorCode {
    fn from(err: &RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => ApiErrorCode::UnknownService,
            RegistryError::NameExists(_) => ApiErrorCode::Conflict,
            RegistryError::Supervisor(_) => ApiErrorCode::SupervisorUnavailable,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ApiErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with an X-Goule-Error header
pub fn json_error_response(
    code: ApiErrorCode,
    message: impl Into<String>,
) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Goule-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_messages() {
        assert_eq!(
            RegistryError::NameExists("svc".to_string()).to_string(),
            "service name already exists: svc"
        );
        assert_eq!(
            RegistryError::NotFound("svc".to_string()).to_string(),
            "service not found: svc"
        );
        assert_eq!(
            RegistryError::from(SupervisorError::LoopNotRunning).to_string(),
            "supervisor loop is not running"
        );
    }

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(ApiErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiErrorCode::UnknownService.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiErrorCode::SupervisorUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_registry_error_maps_to_api_code() {
        let err = RegistryError::NotFound("x".to_string());
        assert_eq!(ApiErrorCode::from(&err), ApiErrorCode::UnknownService);

        let err = RegistryError::Supervisor(SupervisorError::LoopGone);
        assert_eq!(ApiErrorCode::from(&err), ApiErrorCode::SupervisorUnavailable);
    }

    #[test]
    fn test_taken_name_is_a_conflict() {
        let code = ApiErrorCode::from(&RegistryError::NameExists("web".to_string()));
        assert_eq!(code, ApiErrorCode::Conflict);

        let response = json_error_response(code, "service name already exists: web");
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers().get("X-Goule-Error").unwrap(), "CONFLICT");
        assert!(ErrorResponse::new(code, "x").to_json().contains("\"status\":409"));
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ApiErrorCode::UnknownService, "service not found: web");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_SERVICE\""));
        assert!(json.contains("\"message\":\"service not found: web\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(ApiErrorCode::Unauthorized, "unauthorized");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(response.headers().get("X-Goule-Error").unwrap(), "UNAUTHORIZED");
    }
}
