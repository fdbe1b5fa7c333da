use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tracing::{debug, instrument};

use relay_core::{CorrelationId, Notification, NotificationRecord};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Durable last-value store: at most one notification per correlation id.
///
/// Expiry is part of the contract. A row whose `expires_at` is at or before
/// `now` is treated as absent by every read, whether or not it has been
/// physically purged yet.
pub trait NotificationStore: Send + Sync {
    /// Insert or replace the notification for `record.correlation_id`.
    fn put(&self, record: &NotificationRecord) -> Result<(), StoreError>;

    fn get(
        &self,
        correlation_id: &CorrelationId,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, StoreError>;

    /// Remove the row. Returns whether a live (unexpired) row was removed.
    fn delete(&self, correlation_id: &CorrelationId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Physically remove every expired row. Returns the number removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

pub struct NotificationRepo {
    db: Database,
}

impl NotificationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Physical row count, including expired rows not yet purged.
    pub fn count(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 =
                conn.query_row("SELECT COUNT(*) FROM notifications", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }
}

impl NotificationStore for NotificationRepo {
    #[instrument(skip(self, record), fields(correlation_id = %record.correlation_id))]
    fn put(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO notifications (correlation_id, message_id, status, date, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    record.correlation_id.as_str(),
                    record.payload.id,
                    record.payload.status,
                    record.payload.date,
                    record.expires_at.timestamp(),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self, now), fields(correlation_id = %correlation_id))]
    fn get(
        &self,
        correlation_id: &CorrelationId,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT correlation_id, message_id, status, date, expires_at
                 FROM notifications WHERE correlation_id = ?1 AND expires_at > ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![correlation_id.as_str(), now.timestamp()])?;
            match rows.next()? {
                Some(row) => row_to_notification(row).map(Some),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self, now), fields(correlation_id = %correlation_id))]
    fn delete(&self, correlation_id: &CorrelationId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let expires_at: Option<i64> = conn
                .query_row(
                    "DELETE FROM notifications WHERE correlation_id = ?1 RETURNING expires_at",
                    [correlation_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(expires_at.is_some_and(|secs| secs > now.timestamp()))
        })
    }

    #[instrument(skip(self, now))]
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM notifications WHERE expires_at <= ?1",
                [now.timestamp()],
            )?;
            if removed > 0 {
                debug!(removed, "purged expired notifications");
            }
            Ok(removed)
        })
    }
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> Result<NotificationRecord, StoreError> {
    let correlation_id = CorrelationId::from_raw(row_helpers::get::<String>(
        row,
        0,
        "notifications",
        "correlation_id",
    )?);
    let expires_at = row_helpers::parse_unix_secs(
        row_helpers::get(row, 4, "notifications", "expires_at")?,
        "notifications",
        "expires_at",
    )?;
    Ok(NotificationRecord {
        payload: Notification {
            id: row_helpers::get(row, 1, "notifications", "message_id")?,
            status: row_helpers::get(row, 2, "notifications", "status")?,
            date: row_helpers::get(row, 3, "notifications", "date")?,
            order_id: correlation_id.as_str().to_string(),
        },
        correlation_id,
        expires_at,
    })
}
