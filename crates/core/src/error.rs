use serde::{Deserialize, Serialize};

/// Error kinds surfaced by the gateway. Callers branch on the variant; the payload is
/// a human-readable message only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum GatewayError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("authorization_unavailable: {0}")]
    AuthorizationUnavailable(String),
    #[error("backend_unavailable: {0}")]
    BackendUnavailable(String),
    #[error("method_not_allowed: {0}")]
    MethodNotAllowed(String),
    #[error("cancelled")]
    Cancelled,
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// HTTP status the routing layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::NotFound(_) => 404,
            GatewayError::Forbidden(_) => 403,
            GatewayError::Conflict(_) => 409,
            GatewayError::Invalid(_) => 422,
            GatewayError::AuthorizationUnavailable(_) => 503,
            GatewayError::BackendUnavailable(_) => 503,
            GatewayError::MethodNotAllowed(_) => 405,
            // nginx-style "client closed request"
            GatewayError::Cancelled => 499,
        }
    }

    /// Stable lowercase name of the kind, used for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::Invalid(_) => "invalid",
            GatewayError::AuthorizationUnavailable(_) => "authorization_unavailable",
            GatewayError::BackendUnavailable(_) => "backend_unavailable",
            GatewayError::MethodNotAllowed(_) => "method_not_allowed",
            GatewayError::Cancelled => "cancelled",
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self { GatewayError::NotFound(what.to_string()) }

    pub fn forbidden(what: impl std::fmt::Display) -> Self { GatewayError::Forbidden(what.to_string()) }
}
