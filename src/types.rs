use chrono::{DateTime, Utc};
use utoipa::ToSchema;

/// Persisted per-user usage counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub identity: String,

    /// Words charged on the UTC day of `last_usage`.
    pub word_count: u64,
    pub last_usage: Option<DateTime<Utc>>,
}

impl UsageRecord {
    #[must_use]
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            word_count: 0,
            last_usage: None,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, ToSchema, Debug, PartialEq, Eq)]
pub struct UsageStats {
    pub identity: String,
    pub words_used_today: u64,
    pub words_remaining: u64,
    pub max_words_per_day: u64,

    /// RFC 3339, absent if the user never submitted anything.
    pub last_usage: Option<String>,
}

#[derive(serde::Serialize, serde::Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}
