use std::collections::HashMap;

use parking_lot::Mutex;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Issuance record kept for every outstanding one-time token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpRecord {
    pub token: String,
    pub created_at: OffsetDateTime,
    pub user_id: String,
    pub user_name: String,
}

impl OtpRecord {
    fn expires_at(&self, window: Duration) -> OffsetDateTime {
        self.created_at + window
    }
}

/// What the issuer hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

/// Store of single-use channel tokens.
///
/// Tokens leave the store either by being consumed through
/// [`OtpStore::verify_and_consume`] or by the periodic [`OtpStore::sweep`].
/// The TTL checked at consume time and the sweep's retention window are
/// separate settings; the sweep only keeps abandoned tokens from piling up.
pub struct OtpStore {
    ttl: Duration,
    records: Mutex<HashMap<String, OtpRecord>>,
}

impl OtpStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn issue(&self, user_id: &str, user_name: &str) -> TokenGrant {
        self.issue_at(user_id, user_name, OffsetDateTime::now_utc())
    }

    pub fn issue_at(&self, user_id: &str, user_name: &str, now: OffsetDateTime) -> TokenGrant {
        let record = OtpRecord {
            token: Uuid::new_v4().to_string(),
            created_at: now,
            user_id: user_id.to_owned(),
            user_name: user_name.to_owned(),
        };
        let grant = TokenGrant {
            token: record.token.clone(),
            expires_at: record.expires_at(self.ttl),
        };
        self.records.lock().insert(record.token.clone(), record);
        grant
    }

    /// Removes and returns the record for `token` if it is still within its
    /// TTL. Unknown and expired tokens both yield `None`.
    pub fn verify_and_consume(&self, token: &str) -> Option<OtpRecord> {
        self.verify_and_consume_at(token, OffsetDateTime::now_utc())
    }

    pub fn verify_and_consume_at(&self, token: &str, now: OffsetDateTime) -> Option<OtpRecord> {
        let mut records = self.records.lock();
        let record = records.remove(token)?;
        if record.expires_at(self.ttl) <= now {
            return None;
        }
        Some(record)
    }

    /// Drops every record older than `retention`. Returns how many went.
    pub fn sweep(&self, retention: Duration) -> usize {
        self.sweep_at(retention, OffsetDateTime::now_utc())
    }

    pub fn sweep_at(&self, retention: Duration, now: OffsetDateTime) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| record.expires_at(retention) > now);
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
