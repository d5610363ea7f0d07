use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A Discord guild the bot is (or was) a member of.
#[derive(Debug, Clone, FromRow)]
pub struct GuildRecord {
    pub id: i64,
    pub group_id: Option<i64>,
}

/// A Discord user who has connected their Destiny 2 account, together with
/// the OAuth tokens granted during the authorization flow.
///
/// Rows are created by the authorization flow, not by the sync jobs; the
/// jobs only read them and write back refreshed tokens.
#[derive(Debug, Clone, FromRow)]
pub struct LinkedAccount {
    pub id: i64,
    pub membership_type: i64,
    pub membership_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: DateTime<Utc>,
}

impl LinkedAccount {
    /// The stored OAuth credential for this account.
    pub fn credential(&self) -> Credential {
        Credential {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expiry,
        }
    }
}

/// An OAuth access/refresh token pair with its expiry instant.
///
/// An access token past its expiry must never be sent to the Bungie API;
/// callers go through [`crate::oauth::TokenSource::ensure_fresh`] first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}
