//! HTTP surface for the consent redirect and the provider callback.
//!
//! Routes:
//! - `GET /health`
//! - `GET /oauth/{connection}/connect` redirects the user to the consent page
//! - `GET /oauth/{connection}/callback?code=..&realmId=..&state=..` exchanges
//!   the code and stores the resulting token

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router as AxumRouter,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use ledgerlink_config::ConfigError;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::error::ConnectionError;
use crate::manager::ConnectionManager;
use crate::provider::state_connection;

/// Configuration for the callback server.
#[derive(Debug, Clone)]
pub struct CallbackServerConfig {
    pub bind_addr: SocketAddr,
    pub enable_cors: bool,
    /// Reject callbacks without a `state` parameter instead of only
    /// checking the ones that carry it.
    pub require_state: bool,
}

impl Default for CallbackServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: false,
            require_state: false,
        }
    }
}

impl CallbackServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }
}

/// Shared state for the route handlers.
#[derive(Clone)]
struct RouteState {
    manager: Arc<ConnectionManager>,
    require_state: bool,
}

/// Serves the authorization routes for every configured connection.
pub struct CallbackServer {
    config: CallbackServerConfig,
    manager: Arc<ConnectionManager>,
}

impl CallbackServer {
    pub fn new(config: CallbackServerConfig, manager: Arc<ConnectionManager>) -> Self {
        Self { config, manager }
    }

    /// Build the axum router.
    pub fn router(&self) -> AxumRouter {
        let mut router = AxumRouter::new()
            .route("/health", get(handle_health))
            .route("/oauth/{connection}/connect", get(handle_connect))
            .route("/oauth/{connection}/callback", get(handle_callback))
            .with_state(RouteState {
                manager: self.manager.clone(),
                require_state: self.config.require_state,
            });

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        router
    }

    /// Run the server until the process exits.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "Starting OAuth callback server");
        axum::serve(listener, self.router()).await
    }

    /// Run with graceful shutdown, returning the bound address.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "Starting OAuth callback server");
        tokio::spawn(async move {
            axum::serve(listener, self.router())
                .with_graceful_shutdown(shutdown)
                .await
                .ok();
        });
        Ok(local_addr)
    }
}

/// Query parameters the provider appends to the redirect URI.
#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    #[serde(rename = "realmId", alias = "realmid", alias = "realm_id")]
    realm_id: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Handle GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ledgerlink"
    }))
}

/// Handle GET /oauth/{connection}/connect
async fn handle_connect(
    State(state): State<RouteState>,
    Path(connection): Path<String>,
) -> Result<axum::response::Response, CallbackError> {
    let url = state.manager.authorization_url(&connection)?;
    tracing::debug!(connection = %connection, "Redirecting to consent page");
    Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response())
}

/// Handle GET /oauth/{connection}/callback
async fn handle_callback(
    State(route): State<RouteState>,
    Path(connection): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Result<axum::response::Response, CallbackError> {
    if let Some(error) = params.error {
        let message = match params.error_description {
            Some(description) => format!("{}: {}", error, description),
            None => error,
        };
        tracing::info!(connection = %connection, error = %message, "Consent not granted");
        return Err(ConnectionError::InvalidCallback(format!(
            "authorization denied: {}",
            message
        ))
        .into());
    }

    if route.require_state && params.state.is_none() {
        return Err(ConnectionError::InvalidCallback("missing 'state' parameter".to_string()).into());
    }

    if let Some(state) = params.state.as_deref()
        && state_connection(state) != Some(connection.as_str())
    {
        return Err(ConnectionError::InvalidCallback(format!(
            "state does not belong to connection '{}'",
            connection
        ))
        .into());
    }

    let code = params
        .code
        .ok_or_else(|| ConnectionError::InvalidCallback("missing 'code' parameter".to_string()))?;
    let realm_id = params.realm_id.ok_or_else(|| {
        ConnectionError::InvalidCallback("missing 'realmId' parameter".to_string())
    })?;

    let connected = route.manager.handle_callback(&connection, &code, &realm_id).await?;
    let token = connected.token();

    Ok(Json(serde_json::json!({
        "status": "connected",
        "connection": connected.name(),
        "realm_id": token.realm_id,
        "expires_at": token.expires_at.to_rfc3339(),
    }))
    .into_response())
}

/// Error type for callback responses.
#[derive(Debug)]
pub struct CallbackError(ConnectionError);

impl From<ConnectionError> for CallbackError {
    fn from(err: ConnectionError) -> Self {
        Self(err)
    }
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_type) = match &self.0 {
            ConnectionError::AuthorizationRequired { .. } => {
                (StatusCode::UNAUTHORIZED, "authorization_required")
            }
            ConnectionError::ExchangeFailed { .. } => (StatusCode::BAD_GATEWAY, "exchange_failed"),
            ConnectionError::RefreshFailed { .. } => (StatusCode::BAD_GATEWAY, "refresh_failed"),
            ConnectionError::InvalidCallback(_) => (StatusCode::BAD_REQUEST, "invalid_callback"),
            ConnectionError::Config(ConfigError::ConnectionNotFound(_)) => {
                (StatusCode::NOT_FOUND, "unknown_connection")
            }
            ConnectionError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            ConnectionError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            ConnectionError::Api(_) => (StatusCode::BAD_GATEWAY, "api_error"),
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "Callback request failed");
        }

        let body = serde_json::json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": self.0.to_string()
            }
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::{OAuthProvider, ProviderFactory, TokenGrant};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use ledgerlink_config::{ConnectionConfig, LedgerlinkConfig};
    use ledgerlink_store::{MemoryTokenStore, TokenStore};
    use tower::ServiceExt;

    #[derive(Debug)]
    struct StubProvider {
        accept: bool,
    }

    #[async_trait]
    impl OAuthProvider for StubProvider {
        fn authorization_url(&self, state: &str) -> String {
            format!("https://consent.test/authorize?state={}", state)
        }

        async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ProviderError> {
            if !self.accept {
                return Err(ProviderError::InvalidGrant("code already used".into()));
            }
            Ok(TokenGrant {
                access_token: format!("access-for-{}", code),
                refresh_token: Some("refresh-1".into()),
                token_type: "bearer".into(),
                expires_in: Some(3600),
                x_refresh_token_expires_in: None,
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, ProviderError> {
            Err(ProviderError::Network("unused".into()))
        }
    }

    #[derive(Debug)]
    struct StubFactory {
        accept: bool,
    }

    impl ProviderFactory for StubFactory {
        fn provider(
            &self,
            _connection: &str,
            _config: &ConnectionConfig,
        ) -> Result<Arc<dyn OAuthProvider>, ConnectionError> {
            Ok(Arc::new(StubProvider {
                accept: self.accept,
            }))
        }
    }

    fn setup(accept: bool) -> (AxumRouter, Arc<MemoryTokenStore>) {
        setup_with(accept, CallbackServerConfig::default())
    }

    fn setup_with(
        accept: bool,
        server_config: CallbackServerConfig,
    ) -> (AxumRouter, Arc<MemoryTokenStore>) {
        let mut config = LedgerlinkConfig::new();
        config.connections.insert(
            "acme".into(),
            ConnectionConfig {
                client_id: "client".into(),
                redirect_uri: "http://localhost:8080/oauth/{connection}/callback".into(),
                ..Default::default()
            },
        );

        let store = Arc::new(MemoryTokenStore::new());
        let manager = ConnectionManager::new(Arc::new(config), store.clone())
            .with_provider_factory(Arc::new(StubFactory { accept }));
        let server = CallbackServer::new(server_config, Arc::new(manager));
        (server.router(), store)
    }

    async fn get(router: AxumRouter, uri: &str) -> axum::response::Response {
        router
            .oneshot(Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (router, _) = setup(true);
        let response = get(router, "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_connect_redirects_with_state() {
        let (router, _) = setup(true);
        let response = get(router, "/oauth/acme/connect").await;
        assert_eq!(response.status(), StatusCode::FOUND);

        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.starts_with("https://consent.test/authorize?state=acme."));
    }

    #[tokio::test]
    async fn test_connect_unknown_connection() {
        let (router, _) = setup(true);
        let response = get(router, "/oauth/nobody/connect").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_callback_stores_token() {
        let (router, store) = setup(true);
        let response = get(
            router,
            "/oauth/acme/callback?code=abc&realmId=4620816365&state=acme.nonce",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["status"], "connected");
        assert_eq!(body["realm_id"], "4620816365");

        let latest = store.load_latest("acme").await.unwrap().unwrap();
        assert_eq!(latest.access_token, "access-for-abc");
        assert_eq!(latest.refresh_token, "refresh-1");
    }

    #[tokio::test]
    async fn test_callback_accepts_lowercase_realm() {
        let (router, store) = setup(true);
        let response = get(router, "/oauth/acme/callback?code=abc&realmid=42").await;
        assert_eq!(response.status(), StatusCode::OK);
        let latest = store.load_latest("acme").await.unwrap().unwrap();
        assert_eq!(latest.realm_id.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_callback_state_mismatch() {
        let (router, store) = setup(true);
        let response = get(router, "/oauth/acme/callback?code=abc&realmId=1&state=globex.nonce").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(store.row_count("acme"), 0);
    }

    #[tokio::test]
    async fn test_callback_without_state_when_required() {
        let config = CallbackServerConfig {
            require_state: true,
            ..Default::default()
        };
        let (router, store) = setup_with(true, config.clone());
        let response = get(router, "/oauth/acme/callback?code=abc&realmId=1").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["type"], "invalid_callback");
        assert_eq!(store.row_count("acme"), 0);

        let (router, store) = setup_with(true, config);
        let response = get(router, "/oauth/acme/callback?code=abc&realmId=1&state=acme.n").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.row_count("acme"), 1);
    }

    #[tokio::test]
    async fn test_callback_missing_code() {
        let (router, _) = setup(true);
        let response = get(router, "/oauth/acme/callback?realmId=1").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = json_body(response).await;
        assert_eq!(body["error"]["type"], "invalid_callback");
    }

    #[tokio::test]
    async fn test_callback_consent_denied() {
        let (router, store) = setup(true);
        let response = get(router, "/oauth/acme/callback?error=access_denied&state=acme.x").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(store.row_count("acme"), 0);
    }

    #[tokio::test]
    async fn test_callback_exchange_failure() {
        let (router, store) = setup(false);
        let response = get(router, "/oauth/acme/callback?code=used&realmId=1").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = json_body(response).await;
        assert_eq!(body["error"]["type"], "exchange_failed");
        assert_eq!(store.row_count("acme"), 0);
    }

    #[test]
    fn test_config_default() {
        let config = CallbackServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(!config.enable_cors);
        assert!(!config.require_state);
    }
}
