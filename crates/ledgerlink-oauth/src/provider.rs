//! OAuth 2.0 authorization-code flow against the provider's endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ledgerlink_config::{ConnectionConfig, resolve_client_secret};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectionError, ProviderError};

/// Separator between the connection name and the nonce in a state value.
const STATE_SEPARATOR: char = '.';

// ============================================================================
// TokenGrant
// ============================================================================

/// Token endpoint response for both the code exchange and refresh grants.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Absent when the provider keeps the previous refresh token valid.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Access token lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token lifetime in seconds.
    #[serde(default)]
    pub x_refresh_token_expires_in: Option<u64>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &ledgerlink_store::mask_secret(&self.access_token))
            .field(
                "refresh_token",
                &self.refresh_token.as_deref().map(ledgerlink_store::mask_secret),
            )
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("x_refresh_token_expires_in", &self.x_refresh_token_expires_in)
            .finish()
    }
}

// ============================================================================
// Provider traits
// ============================================================================

/// The OAuth operations the lifecycle manager needs from a provider.
#[async_trait]
pub trait OAuthProvider: Send + Sync + std::fmt::Debug {
    /// Consent URL the user is redirected to.
    fn authorization_url(&self, state: &str) -> String;

    /// Exchange an authorization code for a token pair.
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ProviderError>;

    /// Exchange a refresh token for a new token pair.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError>;
}

/// Builds the provider for a configured connection.
pub trait ProviderFactory: Send + Sync + std::fmt::Debug {
    fn provider(
        &self,
        connection: &str,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn OAuthProvider>, ConnectionError>;
}

// ============================================================================
// HttpOAuthProvider
// ============================================================================

/// Token endpoint client using HTTP Basic client authentication.
pub struct HttpOAuthProvider {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    authorize_url: String,
    token_url: String,
    redirect_uri: String,
    scope: String,
}

impl std::fmt::Debug for HttpOAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOAuthProvider")
            .field("client_id", &self.client_id)
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl HttpOAuthProvider {
    /// Create a provider for `connection` with an already-resolved secret.
    pub fn new(
        http: reqwest::Client,
        connection: &str,
        config: &ConnectionConfig,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            client_id: config.client_id.clone(),
            client_secret: client_secret.into(),
            authorize_url: config.authorize_url().to_string(),
            token_url: config.token_url().to_string(),
            redirect_uri: config.redirect_uri_for(connection),
            scope: config.scope.clone(),
        }
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenGrant, ProviderError> {
        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(parse_error_body(status.as_u16(), &body));
        }

        let grant: TokenGrant = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse token response: {}", e)))?;

        if grant.access_token.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "token response has an empty access_token".to_string(),
            ));
        }

        Ok(grant)
    }
}

fn parse_error_body(status: u16, body: &str) -> ProviderError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) if err.error == "invalid_grant" => {
            ProviderError::InvalidGrant(err.error_description.unwrap_or(err.error))
        }
        Ok(err) => ProviderError::Rejected {
            status,
            message: err.error_description.unwrap_or_else(|| err.error.clone()),
            code: err.error,
        },
        Err(_) => ProviderError::Rejected {
            status,
            code: "unknown".to_string(),
            message: if body.is_empty() {
                format!("HTTP {}", status)
            } else {
                body.to_string()
            },
        },
    }
}

#[async_trait]
impl OAuthProvider for HttpOAuthProvider {
    fn authorization_url(&self, state: &str) -> String {
        build_authorization_url(
            &self.authorize_url,
            &self.client_id,
            &self.redirect_uri,
            &self.scope,
            state,
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ProviderError> {
        self.request_token(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.redirect_uri),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        self.request_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }
}

/// Builds [`HttpOAuthProvider`]s, resolving client secrets per connection.
#[derive(Debug, Clone, Default)]
pub struct HttpProviderFactory {
    http: reqwest::Client,
}

impl HttpProviderFactory {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn provider(
        &self,
        connection: &str,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn OAuthProvider>, ConnectionError> {
        let secret = resolve_client_secret(connection, config)?;
        tracing::debug!(connection, source = %secret.source, "Resolved client secret");
        Ok(Arc::new(HttpOAuthProvider::new(
            self.http.clone(),
            connection,
            config,
            secret.value,
        )))
    }
}

// ============================================================================
// URL and state helpers
// ============================================================================

/// Build the consent URL.
pub fn build_authorization_url(
    authorize_url: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: &str,
    state: &str,
) -> String {
    let params = [
        ("client_id", client_id),
        ("response_type", "code"),
        ("scope", scope),
        ("redirect_uri", redirect_uri),
        ("state", state),
    ];

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}?{}", authorize_url, query)
}

/// Generate a state value tying a consent redirect to a connection.
pub fn generate_state(connection: &str) -> String {
    let mut nonce = [0u8; 32];
    rand::rng().fill_bytes(&mut nonce);
    format!(
        "{}{}{}",
        connection,
        STATE_SEPARATOR,
        URL_SAFE_NO_PAD.encode(nonce)
    )
}

/// Connection name embedded in a state value.
pub fn state_connection(state: &str) -> Option<&str> {
    state
        .split_once(STATE_SEPARATOR)
        .map(|(connection, _)| connection)
        .filter(|connection| !connection.is_empty())
}
