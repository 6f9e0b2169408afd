use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Longest a commit waits for the room lock before failing with a conflict.
    pub lock_timeout: Duration,
    pub policy_cache_ttl: Duration,
    pub availability_cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(2000),
            policy_cache_ttl: Duration::from_secs(3600),
            availability_cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Daemon configuration, read from `ROOMGATE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            port: parsed(&lookup, "ROOMGATE_PORT").unwrap_or(d.port),
            bind: lookup("ROOMGATE_BIND").unwrap_or(d.bind),
            data_dir: lookup("ROOMGATE_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            max_connections: parsed(&lookup, "ROOMGATE_MAX_CONNECTIONS").unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "ROOMGATE_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            metrics_port: parsed(&lookup, "ROOMGATE_METRICS_PORT"),
            engine: EngineConfig {
                lock_timeout: parsed(&lookup, "ROOMGATE_LOCK_TIMEOUT_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(d.engine.lock_timeout),
                policy_cache_ttl: parsed(&lookup, "ROOMGATE_POLICY_CACHE_TTL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(d.engine.policy_cache_ttl),
                availability_cache_ttl: parsed(&lookup, "ROOMGATE_AVAILABILITY_CACHE_TTL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(d.engine.availability_cache_ttl),
            },
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|raw| parse_or_warn(key, &raw))
}

fn parse_or_warn<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparsable {key}={raw:?}, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = from_map(&[]);
        assert_eq!(c.port, 7433);
        assert_eq!(c.listen_addr(), "0.0.0.0:7433");
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.engine.lock_timeout, Duration::from_secs(2));
        assert_eq!(c.engine.policy_cache_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn overrides_and_bad_values() {
        let c = from_map(&[
            ("ROOMGATE_PORT", "9000"),
            ("ROOMGATE_DATA_DIR", "/var/lib/roomgate"),
            ("ROOMGATE_METRICS_PORT", "9100"),
            ("ROOMGATE_LOCK_TIMEOUT_MS", "250"),
            ("ROOMGATE_MAX_CONNECTIONS", "lots"),
        ]);
        assert_eq!(c.port, 9000);
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/roomgate"));
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.engine.lock_timeout, Duration::from_millis(250));
        assert_eq!(c.max_connections, 256);
    }
}
