//! Configuration error types.

/// Result type alias for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration loading and resolution.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to write a config file.
    #[error("failed to write config file '{path}': {source}")]
    WriteFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialize config.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Named connection is not configured.
    #[error("connection '{0}' is not configured")]
    ConnectionNotFound(String),

    /// Missing required field.
    #[error("missing required field '{field}' in {context}")]
    MissingField { field: String, context: String },

    /// Client secret not found through any resolution method.
    #[error(
        "client secret not found for connection '{connection}'. Set via keyring, env var ({env_var}), or config file"
    )]
    ClientSecretNotFound { connection: String, env_var: String },

    /// A field has a value that cannot be used.
    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}
