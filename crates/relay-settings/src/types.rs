//! Settings sections. Every section is `#[serde(default)]` so a partial file is valid.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub server: ServerSettings,
    pub relay: RelayPolicy,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values that would make the relay misbehave rather than fail loudly.
    pub fn validate(&self) -> Result<()> {
        if self.relay.notification_ttl_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "relay.notificationTtlSecs must be greater than zero".into(),
            ));
        }
        if self.relay.delivery_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "relay.deliveryTimeoutMs must be greater than zero".into(),
            ));
        }
        for (name, secs) in [
            ("server.heartbeatIntervalSecs", self.server.heartbeat_interval_secs),
            ("server.clientTimeoutSecs", self.server.client_timeout_secs),
            ("server.cleanupIntervalSecs", self.server.cleanup_interval_secs),
            ("relay.purgeIntervalSecs", self.relay.purge_interval_secs),
        ] {
            if secs == 0 {
                return Err(SettingsError::InvalidValue(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.server.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxSendQueue must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// WebSocket listener and per-connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (`0` picks a free port).
    pub port: u16,
    /// Outbound frames buffered per connection before sends fail.
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
    /// A connection with no pong for this long is dropped.
    pub client_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            cleanup_interval_secs: 60,
        }
    }
}

/// Notification lifetime and delivery policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayPolicy {
    /// How long a published notification stays replayable.
    pub notification_ttl_secs: u64,
    /// Upper bound on a single post-to-connection call.
    pub delivery_timeout_ms: u64,
    /// How often expired notifications are physically purged.
    pub purge_interval_secs: u64,
}

impl RelayPolicy {
    pub fn notification_ttl(&self) -> Duration {
        Duration::from_secs(self.notification_ttl_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            notification_ttl_secs: 3600,
            delivery_timeout_ms: 5000,
            purge_interval_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: relay_home().join("database").join("relay.db"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Base level directive (`trace`..`error`). `RUST_LOG` still wins.
    pub level: String,
    /// Per-module levels, e.g. `{"relay_engine": "debug"}`.
    pub modules: BTreeMap<String, String>,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: BTreeMap::new(),
            log_to_sqlite: true,
            log_db_path: relay_home().join("database").join("relay-logs.db"),
        }
    }
}

/// `~/.relay`, falling back to `/tmp/.relay` without a home directory.
pub fn relay_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".relay")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = RelaySettings::default();
        assert_eq!(settings.server.port, 9091);
        assert_eq!(settings.relay.notification_ttl(), Duration::from_secs(3600));
        assert_eq!(settings.relay.delivery_timeout(), Duration::from_millis(5000));
        assert_eq!(settings.logging.level, "info");
        assert!(settings.database.path.ends_with("database/relay.db"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: RelaySettings =
            serde_json::from_str(r#"{"relay":{"notificationTtlSecs":60}}"#).unwrap();
        assert_eq!(settings.relay.notification_ttl_secs, 60);
        assert_eq!(settings.relay.delivery_timeout_ms, 5000);
        assert_eq!(settings.server.port, 9091);
    }

    #[test]
    fn logging_modules_from_json() {
        let settings: RelaySettings =
            serde_json::from_str(r#"{"logging":{"modules":{"relay_engine":"debug"}}}"#).unwrap();
        assert_eq!(
            settings.logging.modules.get("relay_engine").map(String::as_str),
            Some("debug")
        );
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn zero_ttl_is_invalid() {
        let mut settings = RelaySettings::default();
        settings.relay.notification_ttl_secs = 0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn zero_send_queue_is_invalid() {
        let mut settings = RelaySettings::default();
        settings.server.max_send_queue = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_interval_is_invalid() {
        let mut settings = RelaySettings::default();
        settings.relay.purge_interval_secs = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("relay.purgeIntervalSecs"));
    }
}
