//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [database]               # token store location
//! [server]                 # callback server settings
//! [oauth]                  # token lifecycle tuning
//! [connections.acme]       # one table per named connection
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Authorization endpoint used when a connection does not override it.
pub const DEFAULT_AUTHORIZE_URL: &str = "https://appcenter.intuit.com/connect/oauth2";

/// Token endpoint used when a connection does not override it.
pub const DEFAULT_TOKEN_URL: &str = "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";

/// API host for the `development` / `sandbox` base URL alias.
pub const SANDBOX_API_URL: &str = "https://sandbox-quickbooks.api.intuit.com";

/// API host for the `production` base URL alias.
pub const PRODUCTION_API_URL: &str = "https://quickbooks.api.intuit.com";

/// Scope requested when a connection does not set one.
pub const DEFAULT_SCOPE: &str = "com.intuit.quickbooks.accounting";

/// Placeholder expanded to the connection name inside `redirect_uri`.
pub const CONNECTION_PLACEHOLDER: &str = "{connection}";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerlinkConfig {
    /// Token database settings.
    pub database: Option<DatabaseConfig>,

    /// Callback server settings.
    pub server: Option<ServerConfig>,

    /// Token lifecycle settings shared by all connections.
    pub oauth: Option<OAuthSettings>,

    /// Named connections (`[connections.<name>]`).
    pub connections: BTreeMap<String, ConnectionConfig>,
}

impl LedgerlinkConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Connections merge by name; a connection defined in `other` replaces
    /// the whole table of the same name.
    pub fn merge(&mut self, other: LedgerlinkConfig) {
        if other.database.is_some() {
            self.database = other.database;
        }

        if other.server.is_some() {
            self.server = other.server;
        }

        if other.oauth.is_some() {
            self.oauth = other.oauth;
        }

        for (name, connection) in other.connections {
            self.connections.insert(name, connection);
        }
    }

    /// Look up a named connection.
    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig> {
        self.connections
            .get(name)
            .ok_or_else(|| ConfigError::ConnectionNotFound(name.to_string()))
    }

    /// Names of all configured connections, sorted.
    pub fn connection_names(&self) -> Vec<&str> {
        self.connections.keys().map(String::as_str).collect()
    }

    /// Database settings, falling back to defaults.
    pub fn database(&self) -> DatabaseConfig {
        self.database.clone().unwrap_or_default()
    }

    /// Server settings, falling back to defaults.
    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    /// OAuth settings, falling back to defaults.
    pub fn oauth(&self) -> OAuthSettings {
        self.oauth.clone().unwrap_or_default()
    }

    /// Validate the OAuth settings and every connection table.
    pub fn validate(&self) -> Result<()> {
        if let Some(oauth) = &self.oauth {
            oauth.validate()?;
        }
        for (name, connection) in &self.connections {
            validate_connection_name(name)?;
            connection.validate(name)?;
        }
        Ok(())
    }
}

/// Connection names appear in URLs and OAuth state values, so they are
/// restricted to ASCII alphanumerics, `-` and `_`.
pub fn validate_connection_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ConfigError::InvalidValue {
            field: "connections".to_string(),
            message: format!(
                "connection name '{}' may only contain letters, digits, '-' and '_'",
                name
            ),
        });
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Static configuration for one named connection.
///
/// ```toml
/// [connections.acme]
/// client_id = "AB..."
/// scope = "com.intuit.quickbooks.accounting"
/// base_url = "development"
/// redirect_uri = "https://example.com/oauth/{connection}/callback"
/// logs_path = "/var/log/ledgerlink/acme"
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// OAuth client ID.
    pub client_id: String,
    /// OAuth client secret. Prefer the keyring or env var over this field.
    pub client_secret: Option<String>,
    /// Space-separated OAuth scopes.
    pub scope: String,
    /// `development`, `sandbox`, `production`, or an explicit API URL.
    pub base_url: String,
    /// Redirect URI; `{connection}` expands to the connection name.
    pub redirect_uri: String,
    /// Directory for the per-connection API call log.
    pub logs_path: Option<PathBuf>,
    /// Authorization endpoint override.
    pub authorize_url: Option<String>,
    /// Token endpoint override.
    pub token_url: Option<String>,
    /// `minorversion` query parameter sent with API calls.
    pub minor_version: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            scope: DEFAULT_SCOPE.to_string(),
            base_url: "development".to_string(),
            redirect_uri: String::new(),
            logs_path: None,
            authorize_url: None,
            token_url: None,
            minor_version: None,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("scope", &self.scope)
            .field("base_url", &self.base_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("logs_path", &self.logs_path)
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("minor_version", &self.minor_version)
            .finish()
    }
}

impl ConnectionConfig {
    /// Check whether the client secret is stored in plaintext.
    pub fn has_plaintext_secret(&self) -> bool {
        self.client_secret.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Redirect URI with the connection name substituted in.
    pub fn redirect_uri_for(&self, connection: &str) -> String {
        self.redirect_uri.replace(CONNECTION_PLACEHOLDER, connection)
    }

    /// Effective authorization endpoint.
    pub fn authorize_url(&self) -> &str {
        self.authorize_url.as_deref().unwrap_or(DEFAULT_AUTHORIZE_URL)
    }

    /// Effective token endpoint.
    pub fn token_url(&self) -> &str {
        self.token_url.as_deref().unwrap_or(DEFAULT_TOKEN_URL)
    }

    /// Resolve `base_url` aliases into an API root without a trailing slash.
    pub fn api_base_url(&self) -> Result<String> {
        let value = self.base_url.trim();
        match value.to_ascii_lowercase().as_str() {
            "development" | "sandbox" => Ok(SANDBOX_API_URL.to_string()),
            "production" => Ok(PRODUCTION_API_URL.to_string()),
            _ if value.starts_with("http://") || value.starts_with("https://") => {
                Ok(value.trim_end_matches('/').to_string())
            }
            _ => Err(ConfigError::InvalidValue {
                field: "base_url".to_string(),
                message: format!(
                    "'{}' is not 'development', 'sandbox', 'production' or an http(s) URL",
                    value
                ),
            }),
        }
    }

    /// Check required fields for the named connection.
    pub fn validate(&self, name: &str) -> Result<()> {
        let context = format!("[connections.{}]", name);
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "client_id".to_string(),
                context,
            });
        }
        if self.redirect_uri.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "redirect_uri".to_string(),
                context,
            });
        }
        self.api_base_url()?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Database Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Token database file name within the config directory.
pub const DEFAULT_DATABASE_FILE: &str = "tokens.db";

/// Token database section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file path. Defaults to `<config dir>/tokens.db`.
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    /// Resolve the database path, falling back to the config directory.
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            crate::discovery::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(DEFAULT_DATABASE_FILE)
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Callback server section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind: String,
    /// Port to listen on.
    pub port: u16,
    /// Reject callbacks that carry no `state` parameter.
    pub require_state: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            require_state: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OAuth Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Token lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    /// Upper bound on each token endpoint and API call, in seconds.
    pub request_timeout_secs: u64,
    /// Treat access tokens as expired this many seconds early.
    pub expiry_leeway_secs: u64,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            expiry_leeway_secs: 60,
        }
    }
}

/// Longest accepted expiry leeway; a token never lives shorter than this.
pub const MAX_EXPIRY_LEEWAY_SECS: u64 = 3600;

impl OAuthSettings {
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "oauth.request_timeout_secs".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }
        if self.expiry_leeway_secs > MAX_EXPIRY_LEEWAY_SECS {
            return Err(ConfigError::InvalidValue {
                field: "oauth.expiry_leeway_secs".to_string(),
                message: format!(
                    "{} exceeds the maximum of {} seconds",
                    self.expiry_leeway_secs, MAX_EXPIRY_LEEWAY_SECS
                ),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn expiry_leeway(&self) -> Duration {
        Duration::from_secs(self.expiry_leeway_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[database]
path = "/tmp/ledgerlink/tokens.db"

[oauth]
request_timeout_secs = 10

[connections.acme]
client_id = "acme-client"
client_secret = "acme-secret"
base_url = "production"
redirect_uri = "https://example.com/oauth/{connection}/callback"
logs_path = "/var/log/ledgerlink/acme"

[connections.globex]
client_id = "globex-client"
redirect_uri = "http://localhost:8080/oauth/{connection}/callback"
"#;

    #[test]
    fn test_empty_config() {
        let config = LedgerlinkConfig::new();
        assert!(config.database.is_none());
        assert!(config.connections.is_empty());
        assert_eq!(config.server().port, 8080);
        assert_eq!(config.oauth().request_timeout_secs, 30);
    }

    #[test]
    fn test_parse_connections() {
        let config = LedgerlinkConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.connection_names(), vec!["acme", "globex"]);

        let acme = config.connection("acme").unwrap();
        assert_eq!(acme.client_id, "acme-client");
        assert_eq!(acme.scope, DEFAULT_SCOPE);
        assert_eq!(acme.api_base_url().unwrap(), PRODUCTION_API_URL);
        assert_eq!(
            acme.logs_path.as_deref(),
            Some(std::path::Path::new("/var/log/ledgerlink/acme"))
        );

        let globex = config.connection("globex").unwrap();
        assert_eq!(globex.base_url, "development");
        assert_eq!(globex.api_base_url().unwrap(), SANDBOX_API_URL);
        assert!(!globex.has_plaintext_secret());

        assert_eq!(config.oauth().request_timeout_secs, 10);
        assert_eq!(config.oauth().expiry_leeway_secs, 60);
    }

    #[test]
    fn test_missing_connection() {
        let config = LedgerlinkConfig::from_toml(SAMPLE).unwrap();
        let err = config.connection("initech").unwrap_err();
        assert!(matches!(err, ConfigError::ConnectionNotFound(name) if name == "initech"));
    }

    #[test]
    fn test_redirect_uri_expansion() {
        let config = LedgerlinkConfig::from_toml(SAMPLE).unwrap();
        let acme = config.connection("acme").unwrap();
        assert_eq!(
            acme.redirect_uri_for("acme"),
            "https://example.com/oauth/acme/callback"
        );
    }

    #[test]
    fn test_explicit_base_url_and_endpoint_overrides() {
        let connection = ConnectionConfig {
            client_id: "id".to_string(),
            redirect_uri: "http://localhost/cb".to_string(),
            base_url: "http://127.0.0.1:9000/".to_string(),
            token_url: Some("http://127.0.0.1:9000/token".to_string()),
            ..Default::default()
        };
        assert_eq!(connection.api_base_url().unwrap(), "http://127.0.0.1:9000");
        assert_eq!(connection.token_url(), "http://127.0.0.1:9000/token");
        assert_eq!(connection.authorize_url(), DEFAULT_AUTHORIZE_URL);
    }

    #[test]
    fn test_invalid_base_url() {
        let connection = ConnectionConfig {
            client_id: "id".to_string(),
            redirect_uri: "http://localhost/cb".to_string(),
            base_url: "staging".to_string(),
            ..Default::default()
        };
        let err = connection.validate("acme").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "base_url"));
    }

    #[test]
    fn test_validate_missing_client_id() {
        let connection = ConnectionConfig {
            redirect_uri: "http://localhost/cb".to_string(),
            ..Default::default()
        };
        let err = connection.validate("acme").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field, .. } if field == "client_id"));
    }

    #[test]
    fn test_connection_name_rules() {
        assert!(validate_connection_name("acme").is_ok());
        assert!(validate_connection_name("acme_eu-2").is_ok());
        assert!(validate_connection_name("").is_err());
        assert!(validate_connection_name("acme.eu").is_err());
        assert!(validate_connection_name("acme/eu").is_err());
    }

    #[test]
    fn test_zero_request_timeout_rejected() {
        let config = LedgerlinkConfig::from_toml(
            r#"
[oauth]
request_timeout_secs = 0
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { field, .. } if field == "oauth.request_timeout_secs")
        );
    }

    #[test]
    fn test_oversized_expiry_leeway_rejected() {
        let config = LedgerlinkConfig::from_toml(
            r#"
[oauth]
expiry_leeway_secs = 10000000000000
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { field, .. } if field == "oauth.expiry_leeway_secs")
        );

        let at_limit = OAuthSettings {
            expiry_leeway_secs: MAX_EXPIRY_LEEWAY_SECS,
            ..Default::default()
        };
        assert!(at_limit.validate().is_ok());
        assert!(OAuthSettings::default().validate().is_ok());
    }

    #[test]
    fn test_merge_overrides_by_name() {
        let mut base = LedgerlinkConfig::from_toml(SAMPLE).unwrap();
        let overlay = LedgerlinkConfig::from_toml(
            r#"
[server]
port = 9090

[connections.acme]
client_id = "acme-override"
redirect_uri = "http://localhost/cb"
"#,
        )
        .unwrap();

        base.merge(overlay);
        assert_eq!(base.server().port, 9090);
        assert!(!base.server().require_state);
        assert_eq!(base.connection("acme").unwrap().client_id, "acme-override");
        assert_eq!(base.connection("globex").unwrap().client_id, "globex-client");
        // Untouched sections survive
        assert!(base.database.is_some());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = LedgerlinkConfig::from_toml(SAMPLE).unwrap();
        let debug = format!("{:?}", config.connection("acme").unwrap());
        assert!(!debug.contains("acme-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_toml_roundtrip_keeps_connections() {
        let config = LedgerlinkConfig::from_toml(SAMPLE).unwrap();
        let reparsed = LedgerlinkConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(reparsed.connection_names(), config.connection_names());
    }
}
