//! Message shapes exchanged with browser clients.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::grid::GridSnapshot;
use crate::otp::TokenGrant;

/// Body of a token issuance request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    #[serde(default, alias = "user_id")]
    pub user_id: String,
    #[serde(default, alias = "user_name")]
    pub user_name: String,
}

impl TokenRequest {
    /// Both fields must be present and non-empty. Values are otherwise opaque,
    /// so whitespace counts as content.
    pub fn validate(&self) -> Result<(), TokenRequestError> {
        if self.user_id.is_empty() {
            return Err(TokenRequestError::MissingUserId);
        }
        if self.user_name.is_empty() {
            return Err(TokenRequestError::MissingUserName);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TokenRequestError {
    #[error("invalid request body: {0}")]
    Malformed(String),
    #[error("userId is required")]
    MissingUserId,
    #[error("userName is required")]
    MissingUserName,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl From<TokenGrant> for TokenResponse {
    fn from(grant: TokenGrant) -> Self {
        Self {
            token: grant.token,
            expires_at: grant.expires_at,
        }
    }
}

/// Full grid state pushed to every client after each change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GridUpdate {
    pub grid: BTreeMap<usize, String>,
    pub next_pixel: usize,
}

impl From<GridSnapshot> for GridUpdate {
    fn from(snapshot: GridSnapshot) -> Self {
        let next_pixel = snapshot.next_pixel();
        Self {
            grid: snapshot.colors,
            next_pixel,
        }
    }
}
