use std::time::Duration;

use relay_engine::RelayConfig;
use relay_settings::RelaySettings;

/// Listener, per-connection and background-task settings.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// `0` binds a free port.
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub cleanup_interval: Duration,
    pub purge_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9091,
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
            cleanup_interval: Duration::from_secs(60),
            purge_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &RelaySettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_send_queue: server.max_send_queue,
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(server.client_timeout_secs),
            cleanup_interval: Duration::from_secs(server.cleanup_interval_secs),
            purge_interval: settings.relay.purge_interval(),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Relay core tunables taken from the `relay` settings section.
pub fn relay_config(settings: &RelaySettings) -> RelayConfig {
    RelayConfig {
        notification_ttl: settings.relay.notification_ttl(),
        delivery_timeout: settings.relay.delivery_timeout(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_settings_defaults() {
        let from_settings = ServerConfig::from_settings(&RelaySettings::default());
        let defaults = ServerConfig::default();
        assert_eq!(from_settings.port, defaults.port);
        assert_eq!(from_settings.max_send_queue, defaults.max_send_queue);
        assert_eq!(from_settings.client_timeout, defaults.client_timeout);
        assert_eq!(from_settings.purge_interval, defaults.purge_interval);
    }

    #[test]
    fn relay_config_from_settings() {
        let mut settings = RelaySettings::default();
        settings.relay.notification_ttl_secs = 120;
        settings.relay.delivery_timeout_ms = 250;
        let config = relay_config(&settings);
        assert_eq!(config.notification_ttl, Duration::from_secs(120));
        assert_eq!(config.delivery_timeout, Duration::from_millis(250));
    }

    #[test]
    fn bind_addr_joins_host_and_port() {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        assert_eq!(config.bind_addr(), "127.0.0.1:0");
    }
}
