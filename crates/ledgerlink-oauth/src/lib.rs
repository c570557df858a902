//! OAuth 2.0 token lifecycle for named accounting-API connections.
//!
//! A [`Connection`] binds one configured connection to its current token and
//! a typed API client. [`ConnectionManager`] produces connections: it loads
//! the latest stored token, refuses to continue without a refreshable one,
//! refreshes expired tokens under a per-connection lease, and persists every
//! new token it receives.
//!
//! # Components
//!
//! - [`provider`]: authorization URL, code exchange and refresh against the token endpoint
//! - [`manager`]: token lifecycle orchestration and the [`Connection`] aggregate
//! - [`lease`]: per-connection mutual exclusion around refresh-and-save
//! - [`api`]: the forwarded accounting API operations
//! - [`api_log`]: per-connection JSONL log of API calls
//! - [`callback`]: axum routes for the consent redirect and callback

pub mod api;
pub mod api_log;
pub mod callback;
pub mod clock;
pub mod error;
pub mod lease;
pub mod manager;
pub mod provider;

pub use api::{AccountingApi, ApiClient, Invoice, InvoiceLine, Reference};
pub use api_log::{ApiCallLogger, ApiCallRecord};
pub use callback::{CallbackServer, CallbackServerConfig};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{ApiError, AuthorizationReason, ConnectionError, ProviderError, Result};
pub use lease::ConnectionLeases;
pub use manager::{Connection, ConnectionManager, DEFAULT_TOKEN_LIFETIME_SECS, token_from_grant};
pub use provider::{
    HttpOAuthProvider, HttpProviderFactory, OAuthProvider, ProviderFactory, TokenGrant,
};
