//! OAuth token persistence for ledgerlink connections.
//!
//! Every authorization and every refresh produces a new [`Token`] row; rows
//! are never updated in place. The current token for a connection is the row
//! with the most recent `issued_at`.
//!
//! # Components
//!
//! - [`token`]: the token entity and its expiry/refreshability rules
//! - [`store`]: the [`TokenStore`] trait plus SQLite and in-memory backends

pub mod error;
pub mod store;
pub mod token;

pub use error::{Result, StoreError};
pub use store::{
    MemoryTokenStore, SharedTokenStore, SqliteTokenStore, TokenStore, create_memory_token_store,
    create_token_store,
};
pub use token::{Token, mask_secret};
