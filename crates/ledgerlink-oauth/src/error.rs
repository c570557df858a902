//! Error types for connection lifecycle and API access.

use std::time::Duration;

use ledgerlink_config::ConfigError;
use ledgerlink_store::StoreError;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, ConnectionError>;

// ============================================================================
// ProviderError
// ============================================================================

/// Failures talking to the OAuth token endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Network/HTTP transport error.
    #[error("Network error: {0}")]
    Network(String),

    /// The call did not finish within the configured bound.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The code or refresh token is expired, revoked or already used.
    #[error("Grant rejected: {0}")]
    InvalidGrant(String),

    /// Provider returned another error response.
    #[error("Provider error ({status}, {code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    /// Response body was not a usable token response.
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Network(_) | ProviderError::Timeout(_) => true,
            ProviderError::Rejected { status, .. } => *status >= 500 || *status == 429,
            ProviderError::InvalidGrant(_) | ProviderError::InvalidResponse(_) => false,
        }
    }

    /// Whether the grant itself is dead and the user must consent again.
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, ProviderError::InvalidGrant(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Network(e.to_string())
    }
}

// ============================================================================
// ApiError
// ============================================================================

/// Failures from forwarded accounting API calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The access token was rejected.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The API returned a fault.
    #[error("API fault ({status}): {message}")]
    Fault { status: u16, message: String },

    /// The connection has no realm, so there is no company to address.
    #[error("connection '{0}' has no realm id; complete the authorization callback first")]
    MissingRealm(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ApiError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http(e) => e.status().map(|s| s.as_u16()),
            ApiError::Unauthorized(_) => Some(401),
            ApiError::Fault { status, .. } => Some(*status),
            ApiError::MissingRealm(_) | ApiError::Json(_) => None,
        }
    }
}

// ============================================================================
// ConnectionError
// ============================================================================

/// Why a connection needs the user to go through consent again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationReason {
    /// No token has ever been stored for the connection.
    NoToken,
    /// The latest token has no usable refresh token.
    NotRefreshable,
}

impl std::fmt::Display for AuthorizationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorizationReason::NoToken => write!(f, "no stored token"),
            AuthorizationReason::NotRefreshable => write!(f, "stored token is not refreshable"),
        }
    }
}

/// Errors surfaced by the connection lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The caller must send the user through the authorization redirect.
    #[error("authorization required for connection '{connection}': {reason}")]
    AuthorizationRequired {
        connection: String,
        reason: AuthorizationReason,
    },

    /// Refreshing the access token failed. No new token was stored.
    #[error("token refresh failed for connection '{connection}': {source}")]
    RefreshFailed {
        connection: String,
        #[source]
        source: ProviderError,
    },

    /// Exchanging the authorization code failed. No new token was stored.
    #[error("authorization code exchange failed for connection '{connection}': {source}")]
    ExchangeFailed {
        connection: String,
        #[source]
        source: ProviderError,
    },

    /// The callback request was malformed.
    #[error("invalid callback: {0}")]
    InvalidCallback(String),

    /// Token persistence failed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// Connection configuration is missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A forwarded API call failed.
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ConnectionError {
    /// Whether the only way forward is a fresh consent redirect.
    pub fn requires_reauthorization(&self) -> bool {
        match self {
            ConnectionError::AuthorizationRequired { .. } => true,
            ConnectionError::RefreshFailed { source, .. } => source.is_invalid_grant(),
            ConnectionError::ExchangeFailed { .. } => true,
            _ => false,
        }
    }

    /// Whether the caller may retry the same operation with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectionError::RefreshFailed { source, .. }
            | ConnectionError::ExchangeFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        assert!(ProviderError::Network("reset".into()).is_transient());
        assert!(ProviderError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(
            ProviderError::Rejected {
                status: 503,
                code: "unavailable".into(),
                message: "try later".into()
            }
            .is_transient()
        );
        assert!(
            !ProviderError::Rejected {
                status: 400,
                code: "invalid_client".into(),
                message: "bad client".into()
            }
            .is_transient()
        );
        assert!(!ProviderError::InvalidGrant("expired".into()).is_transient());
    }

    #[test]
    fn test_refresh_failed_reauthorization() {
        let permanent = ConnectionError::RefreshFailed {
            connection: "acme".into(),
            source: ProviderError::InvalidGrant("Token invalid".into()),
        };
        assert!(permanent.requires_reauthorization());
        assert!(!permanent.is_transient());

        let transient = ConnectionError::RefreshFailed {
            connection: "acme".into(),
            source: ProviderError::Network("connection refused".into()),
        };
        assert!(!transient.requires_reauthorization());
        assert!(transient.is_transient());
    }

    #[test]
    fn test_authorization_required_display() {
        let err = ConnectionError::AuthorizationRequired {
            connection: "acme".into(),
            reason: AuthorizationReason::NotRefreshable,
        };
        assert_eq!(
            err.to_string(),
            "authorization required for connection 'acme': stored token is not refreshable"
        );
        assert!(err.requires_reauthorization());
    }

    #[test]
    fn test_api_error_status() {
        assert_eq!(ApiError::Unauthorized("expired".into()).status(), Some(401));
        assert_eq!(
            ApiError::Fault {
                status: 400,
                message: "bad".into()
            }
            .status(),
            Some(400)
        );
        assert_eq!(ApiError::MissingRealm("acme".into()).status(), None);
    }
}
