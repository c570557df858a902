//! CLI command handlers.

pub mod auth;
pub mod connections;
pub mod query;
pub mod serve;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use ledgerlink_config::LedgerlinkConfig;
use ledgerlink_oauth::{ConnectionError, ConnectionManager};
use ledgerlink_store::SharedTokenStore;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Explicit config file layered over the discovered ones.
    pub config_path: Option<PathBuf>,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Load and validate the configuration.
    pub fn load_config(&self) -> Result<LedgerlinkConfig> {
        let loaded = ledgerlink_config::load_config(None)?;
        for warning in &loaded.warnings {
            tracing::warn!("{}", warning);
        }
        let mut config = loaded.config;

        if let Some(path) = &self.config_path {
            let explicit = ledgerlink_config::load_config_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            for (name, connection) in &explicit.connections {
                if connection.has_plaintext_secret() {
                    tracing::warn!(
                        "Connection '{}' has a plaintext client_secret in {}",
                        name,
                        path.display()
                    );
                }
            }
            config.merge(explicit);
        }

        config.validate()?;
        Ok(config)
    }

    /// Open the token database named by the config.
    pub fn open_store(&self, config: &LedgerlinkConfig) -> Result<SharedTokenStore> {
        let path = config.database().resolved_path();
        tracing::debug!(path = %path.display(), "Opening token database");
        ledgerlink_store::create_token_store(&path)
            .with_context(|| format!("Failed to open token database at {}", path.display()))
    }

    /// Build a connection manager over the configured store.
    pub fn manager(&self) -> Result<ConnectionManager> {
        let config = self.load_config()?;
        let store = self.open_store(&config)?;
        Ok(ConnectionManager::new(Arc::new(config), store))
    }
}

/// Turn an authorization-required error into an actionable message.
pub fn explain(err: ConnectionError) -> anyhow::Error {
    let hint = match &err {
        ConnectionError::AuthorizationRequired { connection, .. } => Some(format!(
            "Run 'ledgerlink auth url {}' and complete the consent flow.",
            connection
        )),
        ConnectionError::RefreshFailed { connection, .. } if err.requires_reauthorization() => {
            Some(format!(
                "The refresh token is no longer valid. Run 'ledgerlink auth url {}' to reconnect.",
                connection
            ))
        }
        _ => None,
    };

    match hint {
        Some(hint) => anyhow::anyhow!("{}\n{}", err, hint),
        None => err.into(),
    }
}
