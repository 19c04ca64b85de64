//! Daily word quota.
//!
//! A user's usage is a single counter plus the time it was last charged.
//! The counter only counts toward the UTC calendar day of that time; on any
//! other day it is treated as zero.

use anyhow::anyhow;
use chrono::{DateTime, Utc};

use crate::types::{UsageRecord, UsageStats};

/// Upper bound on re-reads when a compare-and-swap write loses a race.
const MAX_CAS_ATTEMPTS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("text is required")]
    InvalidInput,

    #[error("user not found")]
    UserNotFound,

    #[error("word limit exceeded: {used} + {requested} > {limit}")]
    QuotaExceeded { requested: u64, used: u64, limit: u64 },

    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

/// How the updated record is written back.
#[derive(
    serde::Serialize, serde::Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq,
)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    /// One read, one unconditional write. Concurrent requests from the same
    /// user can race and over-admit.
    #[default]
    LastWriteWins,

    /// The write only lands if the stored record still equals what was read.
    /// A lost race re-reads and decides again.
    CompareAndSwap,
}

/// Summary of an admitted request, handed on to the next handler.
#[derive(serde::Serialize, utoipa::ToSchema, Debug, Clone, PartialEq, Eq)]
pub struct Admit {
    pub words: u64,
    pub words_used_today: u64,
    pub words_remaining: u64,
}

#[trait_variant::make(UserStore: Send)]
pub trait LocalUserStore {
    async fn find_by_identity(
        &self,
        identity: &str,
    ) -> anyhow::Result<Option<UsageRecord>>;

    /// Create-or-update keyed by identity.
    async fn save(&self, record: &UsageRecord) -> anyhow::Result<()>;

    /// Writes `next` only if the stored record still equals `prev`.
    /// Returns whether the write happened.
    async fn save_if_unchanged(
        &self,
        prev: &UsageRecord,
        next: &UsageRecord,
    ) -> anyhow::Result<bool>;
}

/// Naive word count: tokens between single spaces. Tabs and newlines do not
/// separate words.
#[must_use]
pub fn count_words(text: &str) -> u64 {
    let n = text.split(' ').filter(|token| !token.is_empty()).count();
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// True if `text` is only whitespace, using the ECMAScript set: Unicode
/// `White_Space` plus U+FEFF, minus U+0085.
#[must_use]
pub fn is_blank(text: &str) -> bool {
    text.chars()
        .all(|c| (c.is_whitespace() && c != '\u{85}') || c == '\u{FEFF}')
}

#[derive(Debug, Clone, Copy)]
pub struct Gate {
    max_words_per_day: u64,
    write_mode: WriteMode,
}

impl Gate {
    #[must_use]
    pub fn new(max_words_per_day: u64, write_mode: WriteMode) -> Self {
        Self {
            max_words_per_day,
            write_mode,
        }
    }

    #[must_use]
    pub fn from_conf(conf: &crate::conf::Conf) -> Self {
        Self::new(conf.max_words_per_day, conf.write_mode)
    }

    #[must_use]
    pub fn max_words_per_day(&self) -> u64 {
        self.max_words_per_day
    }

    /// Charges the words in `text` to `identity` and decides whether the
    /// request may proceed.
    #[tracing::instrument(skip(self, store, text), fields(words))]
    pub async fn evaluate<S: UserStore>(
        &self,
        store: &S,
        identity: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Admit, QuotaError> {
        if is_blank(text) {
            return Err(QuotaError::InvalidInput);
        }
        let words = count_words(text);
        tracing::Span::current().record("words", words);
        match self.write_mode {
            WriteMode::LastWriteWins => {
                let prev = find(store, identity).await?;
                let next = self.apply(&prev, words, now)?;
                UserStore::save(store, &next).await?;
                Ok(self.admit(&next, words))
            }
            WriteMode::CompareAndSwap => {
                for attempt in 1..=MAX_CAS_ATTEMPTS {
                    let prev = find(store, identity).await?;
                    let next = self.apply(&prev, words, now)?;
                    if UserStore::save_if_unchanged(store, &prev, &next).await? {
                        return Ok(self.admit(&next, words));
                    }
                    tracing::debug!(attempt, "Usage record changed under us.");
                }
                Err(anyhow!(
                    "Usage record for {identity:?} kept changing \
                    after {MAX_CAS_ATTEMPTS} attempts"
                )
                .into())
            }
        }
    }

    /// The decision over one record, without I/O. Returns the record to
    /// persist, or the rejection.
    pub fn apply(
        &self,
        record: &UsageRecord,
        words: u64,
        now: DateTime<Utc>,
    ) -> Result<UsageRecord, QuotaError> {
        let limit = self.max_words_per_day;
        if words > limit {
            return Err(QuotaError::QuotaExceeded {
                requested: words,
                used: self.used_today(record, now),
                limit,
            });
        }
        let next = if is_same_day(record.last_usage, now) {
            let total = record.word_count.saturating_add(words);
            if total > limit {
                return Err(QuotaError::QuotaExceeded {
                    requested: words,
                    used: record.word_count,
                    limit,
                });
            }
            UsageRecord {
                word_count: total,
                ..record.clone()
            }
        } else {
            UsageRecord {
                identity: record.identity.clone(),
                word_count: words,
                last_usage: Some(now),
            }
        };
        Ok(next)
    }

    #[must_use]
    pub fn usage(&self, record: &UsageRecord, now: DateTime<Utc>) -> UsageStats {
        let used = self.used_today(record, now);
        UsageStats {
            identity: record.identity.clone(),
            words_used_today: used,
            words_remaining: self.max_words_per_day.saturating_sub(used),
            max_words_per_day: self.max_words_per_day,
            last_usage: record.last_usage.map(|t| t.to_rfc3339()),
        }
    }

    fn used_today(&self, record: &UsageRecord, now: DateTime<Utc>) -> u64 {
        if is_same_day(record.last_usage, now) {
            record.word_count
        } else {
            0
        }
    }

    fn admit(&self, record: &UsageRecord, words: u64) -> Admit {
        Admit {
            words,
            words_used_today: record.word_count,
            words_remaining: self.max_words_per_day.saturating_sub(record.word_count),
        }
    }
}

async fn find<S: UserStore>(
    store: &S,
    identity: &str,
) -> Result<UsageRecord, QuotaError> {
    UserStore::find_by_identity(store, identity)
        .await?
        .ok_or(QuotaError::UserNotFound)
}

fn is_same_day(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last.is_some_and(|last| last.date_naive() == now.date_naive())
}
