/// SQL DDL for the relay store.
/// WAL mode enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS connections (
    connection_id TEXT PRIMARY KEY,
    correlation_id TEXT NOT NULL CHECK (length(trim(correlation_id)) > 0),
    connected_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS notifications (
    correlation_id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    status TEXT NOT NULL,
    date TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_connections_correlation ON connections(correlation_id);
CREATE INDEX IF NOT EXISTS idx_notifications_expiry ON notifications(expires_at);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
