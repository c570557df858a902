//! The OAuth token entity.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Token type recorded when the provider does not send one.
pub const DEFAULT_TOKEN_TYPE: &str = "bearer";

/// One issued access/refresh token pair for a named connection.
///
/// Tokens are immutable records: refreshing a connection stores a new
/// `Token` instead of editing the old one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Connection this token belongs to.
    pub connection: String,
    /// Tenant (company/realm) the token authorizes access to.
    pub realm_id: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// When the provider issued this token.
    pub issued_at: DateTime<Utc>,
    /// When the access token stops working.
    pub expires_at: DateTime<Utc>,
    /// When the refresh token stops working, if the provider said.
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

impl Token {
    /// Create a token with the default token type and no realm.
    pub fn new(
        connection: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            connection: connection.into(),
            realm_id: None,
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            token_type: DEFAULT_TOKEN_TYPE.to_string(),
            issued_at,
            expires_at,
            refresh_expires_at: None,
        }
    }

    /// Set the realm identifier.
    pub fn with_realm(mut self, realm_id: impl Into<String>) -> Self {
        self.realm_id = Some(realm_id.into());
        self
    }

    /// Set the refresh token expiry.
    pub fn with_refresh_expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.refresh_expires_at = Some(at);
        self
    }

    /// Set the token type.
    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    /// Whether the access token is expired at `now`.
    ///
    /// `leeway` treats the token as expired slightly early so a request
    /// started just before expiry does not fail mid-flight.
    /// A leeway too large to subtract counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
        TimeDelta::from_std(leeway)
            .ok()
            .and_then(|leeway| self.expires_at.checked_sub_signed(leeway))
            .is_none_or(|deadline| now >= deadline)
    }

    /// Whether the refresh token can still be exchanged for a new pair.
    pub fn is_refreshable(&self, now: DateTime<Utc>) -> bool {
        if self.refresh_token.trim().is_empty() {
            return false;
        }
        match self.refresh_expires_at {
            Some(at) => now < at,
            None => true,
        }
    }

    /// Time left on the access token, clamped at zero.
    pub fn expires_in(&self, now: DateTime<Utc>) -> TimeDelta {
        (self.expires_at - now).max(TimeDelta::zero())
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("connection", &self.connection)
            .field("realm_id", &self.realm_id)
            .field("access_token", &mask_secret(&self.access_token))
            .field("refresh_token", &mask_secret(&self.refresh_token))
            .field("token_type", &self.token_type)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish()
    }
}

/// Mask a secret for display, keeping only the first and last 4 characters.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 12 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "****".to_string()
    }
}
