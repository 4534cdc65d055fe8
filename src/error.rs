//! User-visible error taxonomy for the gateway HTTP boundary.
//!
//! Internal plumbing uses `anyhow`; anything that can surface to an HTTP
//! client is funneled through [`GatewayError`] so the status mapping lives
//! in exactly one place.

use hyper::StatusCode;
use thiserror::Error;

/// Closed set of failures the gateway reports to clients.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Unknown tunnel, environment, or route.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request lacks a valid session for a private tunnel.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Valid session, wrong environment/profile scope.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Malformed request (bad host header, bad query string).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A tunnel declared injects but the origin responded with a
    /// content encoding the injector cannot transcode.
    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),

    /// The forwarded channel to the agent failed or the origin misbehaved.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Everything else. The cause is logged, never sent to the peer.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Status code mapping at the HTTP boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::UnsupportedEncoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show an untrusted peer. Internal causes stay in the
    /// logs.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::Unauthorized("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::Forbidden("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::Upstream("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::UnsupportedEncoding("zstd".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_cause_not_leaked() {
        let err = GatewayError::Internal(anyhow::anyhow!("secret detail"));
        assert_eq!(err.public_message(), "internal error");

        let err = GatewayError::NotFound("tunnel web-env1".into());
        assert!(err.public_message().contains("web-env1"));
    }
}
