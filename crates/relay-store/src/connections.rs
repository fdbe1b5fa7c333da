use tracing::instrument;

use relay_core::{ConnectionId, ConnectionRecord, CorrelationId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Durable registry of live connections, keyed by connection handle with a
/// secondary lookup by correlation id.
pub trait ConnectionStore: Send + Sync {
    /// Insert or overwrite the record for `record.connection_id`.
    fn put(&self, record: &ConnectionRecord) -> Result<(), StoreError>;

    fn get(&self, connection_id: &ConnectionId) -> Result<Option<ConnectionRecord>, StoreError>;

    /// Remove the record. Returns whether a row existed.
    fn delete(&self, connection_id: &ConnectionId) -> Result<bool, StoreError>;

    /// All connections subscribed to `correlation_id`.
    fn query_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<ConnectionRecord>, StoreError>;
}

pub struct ConnectionRepo {
    db: Database,
}

impl ConnectionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Number of registered connections across all correlation ids.
    pub fn count(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM connections", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }
}

impl ConnectionStore for ConnectionRepo {
    #[instrument(skip(self, record), fields(connection_id = %record.connection_id, correlation_id = %record.correlation_id))]
    fn put(&self, record: &ConnectionRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO connections (connection_id, correlation_id, connected_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    record.connection_id.as_str(),
                    record.correlation_id.as_str(),
                    record.connected_at,
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(connection_id = %connection_id))]
    fn get(&self, connection_id: &ConnectionId) -> Result<Option<ConnectionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT connection_id, correlation_id, connected_at
                 FROM connections WHERE connection_id = ?1",
            )?;
            let mut rows = stmt.query([connection_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_connection(row).map(Some),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self), fields(connection_id = %connection_id))]
    fn delete(&self, connection_id: &ConnectionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM connections WHERE connection_id = ?1",
                [connection_id.as_str()],
            )?;
            Ok(removed > 0)
        })
    }

    #[instrument(skip(self), fields(correlation_id = %correlation_id))]
    fn query_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<ConnectionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT connection_id, correlation_id, connected_at
                 FROM connections INDEXED BY idx_connections_correlation
                 WHERE correlation_id = ?1",
            )?;
            let mut rows = stmt.query([correlation_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_connection(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_connection(row: &rusqlite::Row<'_>) -> Result<ConnectionRecord, StoreError> {
    Ok(ConnectionRecord {
        connection_id: ConnectionId::from_raw(row_helpers::get::<String>(
            row,
            0,
            "connections",
            "connection_id",
        )?),
        correlation_id: CorrelationId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "connections",
            "correlation_id",
        )?),
        connected_at: row_helpers::get(row, 2, "connections", "connected_at")?,
    })
}
