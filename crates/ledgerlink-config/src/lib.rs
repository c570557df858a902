//! Configuration for ledgerlink connections.
//!
//! Provides TOML-based configuration with:
//! - Named connections (`[connections.acme]`, `[connections.globex]`, ...)
//!   carrying OAuth client credentials, scope, API base URL and redirect template
//! - Config file layering (user config dir + project-local overrides)
//! - Client secret resolution (keyring → env var → config file)
//!
//! Configuration is loaded once and handed to the connection manager
//! explicitly; nothing here is read through global state.

pub mod discovery;
pub mod error;
pub mod secrets;
pub mod types;

pub use discovery::{
    LoadedConfig, config_dir, load_config, load_config_file, load_config_with_options,
    save_config, user_config_path,
};
pub use error::{ConfigError, Result};
pub use secrets::{
    ResolvedSecret, SecretSource, client_secret_env_var, resolve_client_secret, store_in_keyring,
};
pub use types::*;
