use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const LOG_SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    message TEXT NOT NULL,
    fields TEXT,
    correlation_id TEXT,
    connection_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
CREATE INDEX IF NOT EXISTS idx_logs_correlation ON logs(correlation_id);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
";

/// A warn+ log line persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub correlation_id: Option<String>,
    pub connection_id: Option<String>,
}

/// Filters for [`SqliteLogSink::query`]. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub correlation_id: Option<String>,
    pub connection_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ logs so delivery failures for an order
/// can be inspected after the fact.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, entry: &LogEntry) {
        let conn = self.conn.lock();
        // A failed log write must never take down the caller.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, correlation_id, connection_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.timestamp,
                entry.level,
                entry.target,
                entry.message,
                entry.fields,
                entry.correlation_id,
                entry.connection_id,
            ],
        );
    }

    /// Newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let filters = [
            ("level = ?", q.level.clone()),
            ("correlation_id = ?", q.correlation_id.clone()),
            ("connection_id = ?", q.connection_id.clone()),
            ("timestamp >= ?", q.since.clone()),
        ];
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, correlation_id, connection_id FROM logs",
        );
        let mut params: Vec<String> = Vec::new();
        for (clause, value) in filters {
            if let Some(value) = value {
                sql.push_str(if params.is_empty() { " WHERE " } else { " AND " });
                sql.push_str(clause);
                params.push(value);
            }
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                correlation_id: row.get(6)?,
                connection_id: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogEntry {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    correlation_id: Option<String>,
    connection_id: Option<String>,
}

impl LogEntry {
    #[cfg(test)]
    fn warn(message: &str, correlation_id: Option<&str>, connection_id: Option<&str>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            level: "WARN".into(),
            target: "relay_engine::broadcast".into(),
            message: message.into(),
            fields: None,
            correlation_id: correlation_id.map(Into::into),
            connection_id: connection_id.map(Into::into),
        }
    }
}

/// tracing Layer that writes warn+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Relay ids lifted out of event or span fields into their own columns.
#[derive(Clone, Default)]
struct RelayIds {
    correlation_id: Option<String>,
    connection_id: Option<String>,
}

impl RelayIds {
    fn fill_from(&mut self, other: &RelayIds) {
        if self.correlation_id.is_none() {
            self.correlation_id.clone_from(&other.correlation_id);
        }
        if self.connection_id.is_none() {
            self.connection_id.clone_from(&other.connection_id);
        }
    }

    fn is_complete(&self) -> bool {
        self.correlation_id.is_some() && self.connection_id.is_some()
    }

    fn is_empty(&self) -> bool {
        self.correlation_id.is_none() && self.connection_id.is_none()
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    ids: RelayIds,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: serde_json::Value) {
        let _ = self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "correlation_id" => self.ids.correlation_id = Some(value.to_string()),
            "connection_id" => self.ids.connection_id = Some(value.to_string()),
            _ => self.put(field, value.into()),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // Display-formatted ids (`%id`) arrive here
        self.record_str(field, format!("{value:?}").trim_matches('"'));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if !visitor.ids.is_complete() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    if let Some(ids) = span.extensions().get::<RelayIds>() {
                        visitor.ids.fill_from(ids);
                    }
                }
            }
        }

        let fields = (!visitor.fields.is_empty())
            .then(|| serde_json::to_string(&visitor.fields).unwrap_or_default());

        self.sink.insert(&LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            correlation_id: visitor.ids.correlation_id,
            connection_id: visitor.ids.connection_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.ids.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.ids);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tracing_subscriber::layer::SubscriberExt;

    fn temp_db() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("relay-test-logs-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("test-logs.db")
    }

    #[test]
    fn sink_insert_and_count() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        sink.insert(&LogEntry::warn("delivery failed", Some("42"), Some("conn_a")));
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn query_by_correlation_id() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        sink.insert(&LogEntry::warn("order 42", Some("42"), None));
        sink.insert(&LogEntry::warn("order 7", Some("7"), None));

        let results = sink
            .query(&LogQuery {
                correlation_id: Some("42".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "order 42");
    }

    #[test]
    fn query_combines_filters() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        sink.insert(&LogEntry::warn("a", Some("42"), Some("conn_a")));
        sink.insert(&LogEntry::warn("b", Some("42"), Some("conn_b")));

        let results = sink
            .query(&LogQuery {
                correlation_id: Some("42".into()),
                connection_id: Some("conn_b".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "b");
    }

    #[test]
    fn query_limit_newest_first() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        for i in 0..10 {
            sink.insert(&LogEntry::warn(&format!("msg {i}"), None, None));
        }

        let results = sink
            .query(&LogQuery {
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].message, "msg 9");
    }

    #[test]
    fn layer_persists_warnings_with_span_ids() {
        let sink = Arc::new(SqliteLogSink::new(&temp_db()).unwrap());
        let subscriber =
            tracing_subscriber::registry().with(SqliteLogLayer::new(Arc::clone(&sink)));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("publish", correlation_id = "42");
            let _entered = span.enter();
            tracing::info!("not persisted");
            tracing::warn!(connection_id = "conn_b", attempts = 1u64, "delivery failed");
        });

        let results = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].level, "WARN");
        assert_eq!(results[0].message, "delivery failed");
        assert_eq!(results[0].correlation_id.as_deref(), Some("42"));
        assert_eq!(results[0].connection_id.as_deref(), Some("conn_b"));
        assert!(results[0].fields.as_deref().unwrap_or_default().contains("attempts"));
    }
}
