//! Token lifecycle orchestration.
//!
//! [`ConnectionManager::initialize`] turns a connection name into a ready
//! [`Connection`]:
//!
//! 1. load the latest stored token,
//! 2. fail with [`ConnectionError::AuthorizationRequired`] when there is none
//!    or it cannot be refreshed,
//! 3. bind a typed API client to its credentials,
//! 4. refresh it first if it has expired.
//!
//! Every refresh and code exchange runs under the connection's lease and
//! writes a new token row only after the provider call succeeded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use ledgerlink_config::{ConnectionConfig, LedgerlinkConfig, OAuthSettings, validate_connection_name};
use ledgerlink_store::{SharedTokenStore, Token};
use parking_lot::Mutex;

use crate::api::ApiClient;
use crate::api_log::ApiCallLogger;
use crate::clock::{SharedClock, SystemClock};
use crate::error::{AuthorizationReason, ConnectionError, ProviderError, Result};
use crate::lease::ConnectionLeases;
use crate::provider::{
    HttpProviderFactory, OAuthProvider, ProviderFactory, TokenGrant, generate_state,
};

/// Access token lifetime assumed when the provider omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// State shared between the manager and every connection it hands out.
#[derive(Debug)]
struct Shared {
    store: SharedTokenStore,
    clock: SharedClock,
    leases: ConnectionLeases,
    settings: OAuthSettings,
}

impl Shared {
    /// Run a provider call bounded by the configured request timeout.
    async fn bounded<F>(&self, call: F) -> std::result::Result<TokenGrant, ProviderError>
    where
        F: Future<Output = std::result::Result<TokenGrant, ProviderError>>,
    {
        let limit = self.settings.request_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(limit)),
        }
    }

    /// Exchange an authorization code and persist the resulting token.
    async fn exchange_and_save(
        &self,
        connection: &str,
        provider: &dyn OAuthProvider,
        code: &str,
        realm_id: &str,
    ) -> Result<Token> {
        if code.trim().is_empty() {
            return Err(ConnectionError::InvalidCallback(
                "missing authorization code".to_string(),
            ));
        }
        if realm_id.trim().is_empty() {
            return Err(ConnectionError::InvalidCallback("missing realm id".to_string()));
        }

        let _lease = self.leases.acquire(connection).await;

        let grant = self
            .bounded(provider.exchange_code(code))
            .await
            .map_err(|source| {
                tracing::warn!(connection, error = %source, "Authorization code exchange failed");
                ConnectionError::ExchangeFailed {
                    connection: connection.to_string(),
                    source,
                }
            })?;

        let previous = self.store.load_latest(connection).await?;
        let token = token_from_grant(connection, grant, None, Some(realm_id), self.clock.now());
        let token = issued_after(token, previous.as_ref());
        if token.refresh_token.is_empty() {
            tracing::warn!(connection, "Provider issued no refresh token; re-authorization will be needed at expiry");
        }

        self.store.save(connection, &token).await?;
        tracing::info!(
            connection,
            realm_id,
            expires_at = %token.expires_at,
            "Authorization completed, token saved"
        );
        Ok(token)
    }
}

/// Keep a new row sorting above `previous` even if the clock stepped back.
///
/// `load_latest` orders by `issued_at`, and the row it returns carries the
/// refresh token the next refresh will spend.
fn issued_after(mut token: Token, previous: Option<&Token>) -> Token {
    if let Some(previous) = previous {
        let floor = previous.issued_at + TimeDelta::milliseconds(1);
        if token.issued_at < floor {
            tracing::debug!(
                connection = %token.connection,
                clock = %token.issued_at,
                "Clock behind latest token, bumping issued_at"
            );
            token.issued_at = floor;
        }
    }
    token
}

/// Build the token to persist from a provider grant.
///
/// `previous` supplies the refresh token, its expiry and the realm when the
/// grant leaves them out. `realm_id` wins over the previous realm.
pub fn token_from_grant(
    connection: &str,
    grant: TokenGrant,
    previous: Option<&Token>,
    realm_id: Option<&str>,
    now: DateTime<Utc>,
) -> Token {
    let lifetime = grant.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);

    let issued_refresh = grant.refresh_token.filter(|t| !t.trim().is_empty());
    let refresh_rotated = issued_refresh.is_some();
    let refresh_token = issued_refresh
        .or_else(|| previous.map(|p| p.refresh_token.clone()))
        .unwrap_or_default();

    let refresh_expires_at = match grant.x_refresh_token_expires_in {
        Some(secs) => Some(now + seconds(secs)),
        None if !refresh_rotated => previous.and_then(|p| p.refresh_expires_at),
        None => None,
    };

    let realm_id = realm_id
        .map(str::to_string)
        .or_else(|| previous.and_then(|p| p.realm_id.clone()));

    Token {
        connection: connection.to_string(),
        realm_id,
        access_token: grant.access_token,
        refresh_token,
        token_type: grant.token_type,
        issued_at: now,
        expires_at: now + seconds(lifetime),
        refresh_expires_at,
    }
}

fn seconds(secs: u64) -> TimeDelta {
    TimeDelta::seconds(secs.min(i32::MAX as u64) as i64)
}

// ============================================================================
// ConnectionManager
// ============================================================================

/// Produces [`Connection`]s for configured connection names.
#[derive(Debug)]
pub struct ConnectionManager {
    config: Arc<LedgerlinkConfig>,
    providers: Arc<dyn ProviderFactory>,
    http: reqwest::Client,
    shared: Arc<Shared>,
    loggers: Mutex<HashMap<String, Arc<ApiCallLogger>>>,
}

impl ConnectionManager {
    /// Create a manager using HTTP providers and the system clock.
    pub fn new(config: Arc<LedgerlinkConfig>, store: SharedTokenStore) -> Self {
        let http = reqwest::Client::new();
        let settings = config.oauth();
        Self {
            providers: Arc::new(HttpProviderFactory::new(http.clone())),
            http,
            shared: Arc::new(Shared {
                store,
                clock: Arc::new(SystemClock),
                leases: ConnectionLeases::new(),
                settings,
            }),
            config,
            loggers: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the provider factory.
    pub fn with_provider_factory(mut self, providers: Arc<dyn ProviderFactory>) -> Self {
        self.providers = providers;
        self
    }

    /// Replace the clock used for expiry decisions.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.shared = Arc::new(Shared {
            store: self.shared.store.clone(),
            clock,
            leases: ConnectionLeases::new(),
            settings: self.shared.settings.clone(),
        });
        self
    }

    /// Replace the HTTP client used for API calls.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn config(&self) -> &LedgerlinkConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedTokenStore {
        &self.shared.store
    }

    pub fn clock(&self) -> &SharedClock {
        &self.shared.clock
    }

    pub fn settings(&self) -> &OAuthSettings {
        &self.shared.settings
    }

    /// Validated configuration for `name`.
    pub fn connection_config(&self, name: &str) -> Result<Arc<ConnectionConfig>> {
        validate_connection_name(name)?;
        self.shared.settings.validate()?;
        let config = self.config.connection(name)?;
        config.validate(name)?;
        Ok(Arc::new(config.clone()))
    }

    /// Load, validate and if necessary refresh the token for `name`.
    pub async fn initialize(&self, name: &str) -> Result<Connection> {
        let config = self.connection_config(name)?;

        let Some(token) = self.shared.store.load_latest(name).await? else {
            tracing::info!(connection = name, "No stored token, authorization required");
            return Err(ConnectionError::AuthorizationRequired {
                connection: name.to_string(),
                reason: AuthorizationReason::NoToken,
            });
        };

        let now = self.shared.clock.now();
        if !token.is_refreshable(now) {
            tracing::info!(connection = name, "Stored token is not refreshable, authorization required");
            return Err(ConnectionError::AuthorizationRequired {
                connection: name.to_string(),
                reason: AuthorizationReason::NotRefreshable,
            });
        }

        let mut connection = self.bind(name, config, token)?;
        if connection.is_expired() {
            tracing::debug!(connection = name, "Access token expired, refreshing");
            connection.refresh().await?;
        }
        Ok(connection)
    }

    /// Consent URL for `name`. Needs no stored token.
    pub fn authorization_url(&self, name: &str) -> Result<String> {
        let config = self.connection_config(name)?;
        let provider = self.providers.provider(name, &config)?;
        Ok(provider.authorization_url(&generate_state(name)))
    }

    /// Complete a first-time (or repeated) authorization for `name`.
    pub async fn handle_callback(
        &self,
        name: &str,
        code: &str,
        realm_id: &str,
    ) -> Result<Connection> {
        let config = self.connection_config(name)?;
        let provider = self.providers.provider(name, &config)?;
        let token = self
            .shared
            .exchange_and_save(name, provider.as_ref(), code, realm_id)
            .await?;
        self.bind_with_provider(name, config, token, provider)
    }

    fn bind(&self, name: &str, config: Arc<ConnectionConfig>, token: Token) -> Result<Connection> {
        let provider = self.providers.provider(name, &config)?;
        self.bind_with_provider(name, config, token, provider)
    }

    fn bind_with_provider(
        &self,
        name: &str,
        config: Arc<ConnectionConfig>,
        token: Token,
        provider: Arc<dyn OAuthProvider>,
    ) -> Result<Connection> {
        let mut api = ApiClient::new(
            self.http.clone(),
            name,
            config.api_base_url()?,
            &token,
            self.shared.settings.request_timeout(),
        )
        .with_minor_version(config.minor_version);

        if let Some(logger) = self.logger_for(name, &config) {
            api = api.with_logger(logger);
        }

        Ok(Connection {
            name: name.to_string(),
            config,
            token,
            api,
            provider,
            shared: self.shared.clone(),
        })
    }

    fn logger_for(&self, name: &str, config: &ConnectionConfig) -> Option<Arc<ApiCallLogger>> {
        let dir = config.logs_path.as_ref()?;
        let mut loggers = self.loggers.lock();
        if let Some(logger) = loggers.get(name) {
            return Some(logger.clone());
        }
        match ApiCallLogger::new(dir) {
            Ok(logger) => {
                let logger = Arc::new(logger);
                loggers.insert(name.to_string(), logger.clone());
                Some(logger)
            }
            Err(e) => {
                tracing::warn!(
                    connection = name,
                    path = %dir.display(),
                    error = %e,
                    "Cannot open API call log directory, calls will not be logged"
                );
                None
            }
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A configured connection bound to its current token and API client.
#[derive(Debug)]
pub struct Connection {
    name: String,
    config: Arc<ConnectionConfig>,
    token: Token,
    api: ApiClient,
    provider: Arc<dyn OAuthProvider>,
    shared: Arc<Shared>,
}

impl Connection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The token the API client is currently using.
    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn realm_id(&self) -> Option<&str> {
        self.token.realm_id.as_deref()
    }

    /// API client bound to the current credentials.
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Whether the current access token is expired, leeway included.
    pub fn is_expired(&self) -> bool {
        self.token
            .is_expired(self.shared.clock.now(), self.shared.settings.expiry_leeway())
    }

    /// Consent URL for this connection.
    pub fn authorization_url(&self) -> String {
        self.provider.authorization_url(&generate_state(&self.name))
    }

    /// Obtain a new token pair and persist it.
    ///
    /// Under the lease the latest stored token is read again. If another
    /// task has already stored a newer token that is still valid, it is
    /// adopted and the provider is not called. On failure nothing is stored
    /// and the connection keeps its previous credentials.
    pub async fn refresh(&mut self) -> Result<()> {
        let _lease = self.shared.leases.acquire(&self.name).await;

        let now = self.shared.clock.now();
        let leeway = self.shared.settings.expiry_leeway();
        let base = match self.shared.store.load_latest(&self.name).await? {
            Some(latest)
                if latest.access_token != self.token.access_token
                    && !latest.is_expired(now, leeway) =>
            {
                tracing::debug!(connection = %self.name, "Adopting token refreshed by another task");
                self.apply(latest);
                return Ok(());
            }
            Some(latest) => latest,
            None => self.token.clone(),
        };

        if !base.is_refreshable(now) {
            return Err(ConnectionError::AuthorizationRequired {
                connection: self.name.clone(),
                reason: AuthorizationReason::NotRefreshable,
            });
        }

        let grant = self
            .shared
            .bounded(self.provider.refresh(&base.refresh_token))
            .await
            .map_err(|source| {
                if source.is_transient() {
                    tracing::warn!(connection = %self.name, error = %source, "Token refresh failed, may be retried");
                } else {
                    tracing::warn!(connection = %self.name, error = %source, "Token refresh rejected");
                }
                ConnectionError::RefreshFailed {
                    connection: self.name.clone(),
                    source,
                }
            })?;

        let token = token_from_grant(&self.name, grant, Some(&base), None, self.shared.clock.now());
        let token = issued_after(token, Some(&base));
        self.shared.store.save(&self.name, &token).await?;
        tracing::info!(
            connection = %self.name,
            expires_at = %token.expires_at,
            "Token refreshed"
        );

        self.apply(token);
        Ok(())
    }

    /// Exchange a callback's authorization code and switch to the new token.
    pub async fn handle_authorization_callback(&mut self, code: &str, realm_id: &str) -> Result<()> {
        let token = self
            .shared
            .exchange_and_save(&self.name, self.provider.as_ref(), code, realm_id)
            .await?;
        self.apply(token);
        Ok(())
    }

    fn apply(&mut self, token: Token) {
        self.api.update_credentials(&token);
        self.token = token;
    }
}
