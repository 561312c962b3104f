//! Server configuration from the environment.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::sync::SyncServerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Settings of the collaboration server binary
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub max_peers_per_session: usize,
    /// How long an empty session survives before eviction
    pub session_grace: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 5000,
            max_peers_per_session: 50,
            session_grace: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Read `HOST`, `PORT`, `MAX_PEERS_PER_SESSION`, `SESSION_GRACE_SECS` and
    /// `CLEANUP_INTERVAL_SECS`; unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            host: parse(&lookup, "HOST")?.unwrap_or(defaults.host),
            port: parse(&lookup, "PORT")?.unwrap_or(defaults.port),
            max_peers_per_session: parse(&lookup, "MAX_PEERS_PER_SESSION")?
                .unwrap_or(defaults.max_peers_per_session),
            session_grace: parse(&lookup, "SESSION_GRACE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_grace),
            cleanup_interval: parse_interval(&lookup, "CLEANUP_INTERVAL_SECS")?
                .unwrap_or(defaults.cleanup_interval),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn sync_server_config(&self) -> SyncServerConfig {
        SyncServerConfig {
            max_peers_per_session: self.max_peers_per_session,
            cleanup_interval: self.cleanup_interval,
            session_grace: self.session_grace,
        }
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        _ => Ok(None),
    }
}

/// Whole seconds, at least one; tokio intervals panic on a zero period
fn parse_interval<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse::<u64, F>(lookup, key)? {
        Some(0) => Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
        }),
        secs => Ok(secs.map(Duration::from_secs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.addr().to_string(), "0.0.0.0:5000");
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "8080"),
            ("MAX_PEERS_PER_SESSION", "4"),
            ("SESSION_GRACE_SECS", "10"),
            ("CLEANUP_INTERVAL_SECS", " 2 "),
        ]))
        .unwrap();

        assert_eq!(config.addr().to_string(), "127.0.0.1:8080");
        let server = config.sync_server_config();
        assert_eq!(server.max_peers_per_session, 4);
        assert_eq!(server.session_grace, Duration::from_secs(10));
        assert_eq!(server.cleanup_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_value() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PORT", .. }));
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn test_zero_cleanup_interval_rejected() {
        let err = ServerConfig::from_lookup(lookup(&[("CLEANUP_INTERVAL_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CLEANUP_INTERVAL_SECS", .. }));

        // A zero grace period just means immediate eviction
        let config = ServerConfig::from_lookup(lookup(&[("SESSION_GRACE_SECS", "0")])).unwrap();
        assert_eq!(config.session_grace, Duration::ZERO);
    }
}
