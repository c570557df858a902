//! Client secret retrieval.
//!
//! Resolution order:
//! 1. System keyring (if `keyring` feature enabled)
//! 2. Environment variable `LEDGERLINK_<NAME>_CLIENT_SECRET`
//! 3. Config file (with warning at load time)
//!
//! Keyring entries are stored as service="ledgerlink", user="<name>_client_secret".

use crate::{ConfigError, ConnectionConfig, Result};

/// Keyring service name.
const SERVICE_NAME: &str = "ledgerlink";

/// A resolved secret together with where it came from.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedSecret {
    /// The secret value.
    pub value: String,
    /// Where the secret was found.
    pub source: SecretSource,
}

impl std::fmt::Debug for ResolvedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecret")
            .field("value", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

/// Where a secret was resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// OS keyring.
    Keyring,
    /// Environment variable.
    EnvVar(String),
    /// Config file (plaintext, not recommended).
    ConfigFile,
}

impl std::fmt::Display for SecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretSource::Keyring => write!(f, "system keyring"),
            SecretSource::EnvVar(var) => write!(f, "env var {}", var),
            SecretSource::ConfigFile => write!(f, "config file (plaintext)"),
        }
    }
}

/// Environment variable consulted for a connection's client secret.
///
/// `acme-eu` becomes `LEDGERLINK_ACME_EU_CLIENT_SECRET`.
pub fn client_secret_env_var(connection: &str) -> String {
    let normalized: String = connection
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("LEDGERLINK_{}_CLIENT_SECRET", normalized)
}

/// Resolve the client secret for a connection using the full resolution chain.
pub fn resolve_client_secret(connection: &str, config: &ConnectionConfig) -> Result<ResolvedSecret> {
    if let Some(secret) = get_from_keyring(connection) {
        return Ok(secret);
    }

    let env_var = client_secret_env_var(connection);
    if let Ok(value) = std::env::var(&env_var)
        && !value.is_empty()
    {
        return Ok(ResolvedSecret {
            value,
            source: SecretSource::EnvVar(env_var),
        });
    }

    match config.client_secret.as_deref() {
        Some(value) if !value.is_empty() => Ok(ResolvedSecret {
            value: value.to_string(),
            source: SecretSource::ConfigFile,
        }),
        _ => Err(ConfigError::ClientSecretNotFound {
            connection: connection.to_string(),
            env_var,
        }),
    }
}

/// Store a client secret in the system keyring.
pub fn store_in_keyring(connection: &str, secret: &str) -> std::result::Result<(), String> {
    store_keyring_entry(SERVICE_NAME, &keyring_user(connection), secret)
}

fn keyring_user(connection: &str) -> String {
    format!("{}_client_secret", connection)
}

// ─────────────────────────────────────────────────────────────────────────────
// Keyring implementation (feature-gated)
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(feature = "keyring")]
fn get_from_keyring(connection: &str) -> Option<ResolvedSecret> {
    // Keep tests isolated from the local machine's keychain.
    if cfg!(test) {
        return None;
    }

    let entry = keyring::Entry::new(SERVICE_NAME, &keyring_user(connection)).ok()?;
    let value = entry.get_password().ok()?;
    if value.is_empty() {
        return None;
    }
    Some(ResolvedSecret {
        value,
        source: SecretSource::Keyring,
    })
}

#[cfg(feature = "keyring")]
fn store_keyring_entry(service: &str, user: &str, secret: &str) -> std::result::Result<(), String> {
    if cfg!(test) {
        return Err("keyring access disabled in tests".to_string());
    }
    let entry = keyring::Entry::new(service, user).map_err(|e| format!("keyring error: {}", e))?;
    entry
        .set_password(secret)
        .map_err(|e| format!("failed to store in keyring: {}", e))
}

#[cfg(not(feature = "keyring"))]
fn get_from_keyring(_connection: &str) -> Option<ResolvedSecret> {
    None
}

#[cfg(not(feature = "keyring"))]
fn store_keyring_entry(
    _service: &str,
    _user: &str,
    _secret: &str,
) -> std::result::Result<(), String> {
    Err("keyring support not compiled in (enable the 'keyring' feature)".to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(secret: Option<&str>) -> ConnectionConfig {
        ConnectionConfig {
            client_id: "id".to_string(),
            client_secret: secret.map(str::to_string),
            redirect_uri: "http://localhost/cb".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(client_secret_env_var("acme"), "LEDGERLINK_ACME_CLIENT_SECRET");
        assert_eq!(
            client_secret_env_var("acme-eu"),
            "LEDGERLINK_ACME_EU_CLIENT_SECRET"
        );
    }

    #[test]
    fn test_resolve_from_config_value() {
        let resolved =
            resolve_client_secret("secrets_test_config_only", &connection(Some("from-file")))
                .unwrap();
        assert_eq!(resolved.value, "from-file");
        assert_eq!(resolved.source, SecretSource::ConfigFile);
    }

    #[test]
    fn test_resolve_missing() {
        let err = resolve_client_secret("secrets_test_missing", &connection(None)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ClientSecretNotFound { env_var, .. }
                if env_var == "LEDGERLINK_SECRETS_TEST_MISSING_CLIENT_SECRET"
        ));
    }

    #[test]
    fn test_empty_config_secret_is_missing() {
        let result = resolve_client_secret("secrets_test_empty", &connection(Some("")));
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_redacts_value() {
        let resolved = ResolvedSecret {
            value: "super-secret".to_string(),
            source: SecretSource::ConfigFile,
        };
        assert!(!format!("{:?}", resolved).contains("super-secret"));
    }

    #[test]
    fn test_secret_source_display() {
        assert_eq!(SecretSource::Keyring.to_string(), "system keyring");
        assert_eq!(
            SecretSource::EnvVar("LEDGERLINK_ACME_CLIENT_SECRET".to_string()).to_string(),
            "env var LEDGERLINK_ACME_CLIENT_SECRET"
        );
        assert_eq!(
            SecretSource::ConfigFile.to_string(),
            "config file (plaintext)"
        );
    }

    #[cfg(not(feature = "keyring"))]
    #[test]
    fn test_store_keyring_disabled() {
        let result = store_in_keyring("acme", "secret");
        assert!(result.unwrap_err().contains("not compiled"));
    }
}
