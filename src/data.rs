use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use sqlx::Executor;

use crate::{quota::UserStore, types::UsageRecord};

const MIGRATIONS: [&str; 1] = [include_str!("../migrations/0_data.sql")];

#[derive(sqlx::FromRow)]
struct UserRow {
    email: String,
    word_count: i64,
    last_usage_date: Option<i64>,
}

impl TryFrom<UserRow> for UsageRecord {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> anyhow::Result<Self> {
        let UserRow {
            email,
            word_count,
            last_usage_date,
        } = row;
        let word_count = u64::try_from(word_count)
            .context(format!("Negative word_count for {email:?}"))?;
        let last_usage = last_usage_date
            .map(|millis| {
                DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
                    anyhow!("Out of range last_usage_date={millis} for {email:?}")
                })
            })
            .transpose()?;
        Ok(Self {
            identity: email,
            word_count,
            last_usage,
        })
    }
}

/// Column values for binding: (word_count, last_usage_date).
fn columns(record: &UsageRecord) -> anyhow::Result<(i64, Option<i64>)> {
    let word_count = i64::try_from(record.word_count)?;
    let last_usage = record.last_usage.map(|t| t.timestamp_millis());
    Ok((word_count, last_usage))
}

#[derive(Clone)]
pub struct Storage {
    pool: sqlx::Pool<sqlx::Sqlite>,
}

impl Storage {
    pub async fn connect<P: AsRef<Path>>(
        file_path: P,
        busy_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let file_path = file_path.as_ref();
        if let Some(parent) = file_path.parent() {
            let ctx = format!(
                "Failed to create parent directory \
                for database file: {file_path:?}"
            );
            fs::create_dir_all(parent).context(ctx)?;
        }
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(file_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);
        let pool = sqlx::SqlitePool::connect_with(options)
            .await
            .context(format!("Failed to open database: {file_path:?}"))?;
        let selph = Self { pool };
        for migration in MIGRATIONS {
            selph.pool.execute(migration).await?;
        }
        Ok(selph)
    }

    /// Registers a user with a zeroed usage record. Returns `false` if the
    /// user already existed, in which case the record is left untouched.
    pub async fn user_add(&self, identity: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "INSERT INTO users (email, word_count, last_usage_date)
                VALUES (?, 0, NULL)
                ON CONFLICT(email) DO NOTHING",
        )
        .bind(identity)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }
}

impl UserStore for Storage {
    async fn find_by_identity(
        &self,
        identity: &str,
    ) -> anyhow::Result<Option<UsageRecord>> {
        let row_opt: Option<UserRow> =
            sqlx::query_as("SELECT * FROM users WHERE email = ?")
                .bind(identity)
                .fetch_optional(&self.pool)
                .await?;
        row_opt.map(UsageRecord::try_from).transpose()
    }

    async fn save(&self, record: &UsageRecord) -> anyhow::Result<()> {
        let (word_count, last_usage) = columns(record)?;
        sqlx::query(
            "INSERT INTO users (email, word_count, last_usage_date)
                VALUES (?, ?, ?)
                ON CONFLICT(email) DO UPDATE SET
                word_count = excluded.word_count,
                last_usage_date = excluded.last_usage_date",
        )
        .bind(&record.identity)
        .bind(word_count)
        .bind(last_usage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_if_unchanged(
        &self,
        prev: &UsageRecord,
        next: &UsageRecord,
    ) -> anyhow::Result<bool> {
        if prev.identity != next.identity {
            return Err(anyhow!(
                "Identity mismatch: {:?} vs {:?}",
                prev.identity,
                next.identity
            ));
        }
        let (prev_count, prev_usage) = columns(prev)?;
        let (next_count, next_usage) = columns(next)?;
        let result = sqlx::query(
            "UPDATE users SET
                word_count = ?,
                last_usage_date = ?
                WHERE email = ?
                AND word_count = ?
                AND last_usage_date IS ?",
        )
        .bind(next_count)
        .bind(next_usage)
        .bind(&next.identity)
        .bind(prev_count)
        .bind(prev_usage)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use crate::{quota::UserStore, types::UsageRecord};

    use super::Storage;

    async fn storage(dir: &tempfile::TempDir) -> Storage {
        Storage::connect(dir.path().join("data").join("data.db"), Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn user_add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;

        assert!(storage.user_add("ada@example.com").await.unwrap());
        assert!(!storage.user_add("ada@example.com").await.unwrap());

        let record = storage
            .find_by_identity("ada@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record, UsageRecord::new("ada@example.com"));
    }

    #[tokio::test]
    async fn user_add_keeps_existing_usage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 12, 0, 0).unwrap();
        let used = UsageRecord {
            identity: "ada@example.com".to_string(),
            word_count: 7,
            last_usage: Some(now),
        };
        storage.save(&used).await.unwrap();

        assert!(!storage.user_add("ada@example.com").await.unwrap());
        let found = storage.find_by_identity("ada@example.com").await.unwrap();
        assert_eq!(found, Some(used));
    }

    #[tokio::test]
    async fn unknown_user_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        assert_eq!(storage.find_by_identity("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        storage.user_add("ada@example.com").await.unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 12, 0, 0).unwrap()
            + chrono::Duration::milliseconds(123);
        let record = UsageRecord {
            identity: "ada@example.com".to_string(),
            word_count: 79_500,
            last_usage: Some(now),
        };

        storage.save(&record).await.unwrap();

        let found = storage.find_by_identity("ada@example.com").await.unwrap();
        assert_eq!(found, Some(record));
    }

    #[tokio::test]
    async fn save_if_unchanged_only_lands_on_a_match() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        storage.user_add("ada@example.com").await.unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 12, 0, 0).unwrap();
        let fresh = UsageRecord::new("ada@example.com");
        let first = UsageRecord {
            word_count: 10,
            last_usage: Some(now),
            ..fresh.clone()
        };
        let second = UsageRecord {
            word_count: 20,
            ..first.clone()
        };

        assert!(storage.save_if_unchanged(&fresh, &first).await.unwrap());
        // Stale view of the row: must not clobber.
        assert!(!storage.save_if_unchanged(&fresh, &second).await.unwrap());
        assert!(storage.save_if_unchanged(&first, &second).await.unwrap());

        let found = storage.find_by_identity("ada@example.com").await.unwrap();
        assert_eq!(found, Some(second));
    }

    #[tokio::test]
    async fn data_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        storage(&dir).await.user_add("ada@example.com").await.unwrap();
        let found = storage(&dir)
            .await
            .find_by_identity("ada@example.com")
            .await
            .unwrap();
        assert!(found.is_some());
    }
}
