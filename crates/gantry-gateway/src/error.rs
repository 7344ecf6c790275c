//! Gateway error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gantry_broker::BrokerError;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// A worker answered with something that cannot be turned into HTTP.
    #[error("Invalid worker response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Broker(_) => "broker_error",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Io(_) => "io_error",
        }
    }

    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
            Self::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::warn!(error = %self, error_type = self.error_type(), "request failed");

        // Internal details stay in the logs.
        let message = match &self {
            Self::InvalidResponse(_) => "Bad gateway",
            Self::Broker(_) => "Service unavailable",
            Self::Config(_) | Self::Io(_) => "Internal server error",
        };

        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_codes() {
        assert_eq!(
            GatewayError::InvalidResponse("status 42".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Broker(BrokerError::Closed).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn error_types() {
        assert_eq!(
            GatewayError::InvalidResponse(String::new()).error_type(),
            "invalid_response"
        );
        assert_eq!(GatewayError::Broker(BrokerError::Closed).error_type(), "broker_error");
    }
}
