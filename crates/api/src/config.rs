//! Process configuration for the API binary.
//!
//! Engine settings come from [`EngineConfig`]; this adds the listener and
//! backend selection:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `TASKFORGE_BIND_ADDR` | `0.0.0.0:8080` |
//! | `DATABASE_URL` | unset → in-memory store |
//! | `DATABASE_MAX_CONNECTIONS` | `10` |
//! | `REDIS_URL` | unset → in-memory queue (needs feature `redis`) |

use std::net::SocketAddr;

use taskforge_infra::{ConfigError, EngineConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    pub engine: EngineConfig,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let bind_raw = get("TASKFORGE_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let bind_addr = bind_raw.trim().parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
            var: "TASKFORGE_BIND_ADDR".into(),
            value: bind_raw.clone(),
            reason: e.to_string(),
        })?;

        let database_max_connections = match get("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
                var: "DATABASE_MAX_CONNECTIONS".into(),
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => 10,
        };

        Ok(Self {
            bind_addr,
            database_url: get("DATABASE_URL"),
            database_max_connections,
            redis_url: get("REDIS_URL"),
            engine: EngineConfig::from_lookup(&lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_use_in_memory_backends() {
        let config = ApiConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert!(config.database_url.is_none());
        assert!(config.redis_url.is_none());
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn reads_backends_and_engine_settings() {
        let config = ApiConfig::from_lookup(lookup(&[
            ("TASKFORGE_BIND_ADDR", "127.0.0.1:9000"),
            ("DATABASE_URL", "postgres://localhost/taskforge"),
            ("TASKFORGE_WORKERS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/taskforge"));
        assert_eq!(config.engine.workers, 2);
    }

    #[test]
    fn bad_bind_address_is_reported() {
        let err = ApiConfig::from_lookup(lookup(&[("TASKFORGE_BIND_ADDR", "nowhere")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "TASKFORGE_BIND_ADDR"));
    }
}
