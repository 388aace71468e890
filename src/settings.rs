//! Runtime settings read from the environment. Call `dotenvy::dotenv()` first so a `.env` file is honored.

use crate::error::ConfigError;
use crate::registry::SecretKey;
use std::str::FromStr;
use std::time::Duration;

/// Limits applied to synthesized list endpoints.
#[derive(Clone, Debug)]
pub struct DispatchSettings {
    pub default_limit: u32,
    pub max_limit: u32,
    /// Upper bound on values accepted by an `in` filter.
    pub max_in_values: usize,
    pub pool_max_connections: u32,
    pub acquire_timeout: Duration,
    pub read_retry_backoff: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 1000,
            max_in_values: 100,
            pool_max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
            read_retry_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Clone, Debug)]
pub struct IntrospectionSettings {
    pub connect_timeout: Duration,
}

impl Default for IntrospectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    pub docker_bin: String,
    /// Upper bound on a single runtime command.
    pub docker_timeout: Duration,
    /// Host the provisioned databases are reachable on.
    pub db_host: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Also try binding each candidate port before handing it out.
    pub check_host_ports: bool,
    pub memory_mb: u32,
    pub cpu_share: f32,
    pub postgres_image: String,
    pub mysql_image: String,
    pub readiness_timeout: Duration,
    pub readiness_attempts: u32,
    pub readiness_initial_backoff: Duration,
    pub readiness_max_backoff: Duration,
    pub probe_timeout: Duration,
    pub health_interval: Duration,
    pub health_failure_threshold: u32,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            docker_bin: "docker".into(),
            docker_timeout: Duration::from_secs(300),
            db_host: "127.0.0.1".into(),
            port_range_start: 5433,
            port_range_end: 6432,
            check_host_ports: true,
            memory_mb: 512,
            cpu_share: 0.5,
            postgres_image: "postgres:15-alpine".into(),
            mysql_image: "mysql:8.0".into(),
            readiness_timeout: Duration::from_secs(60),
            readiness_attempts: 30,
            readiness_initial_backoff: Duration::from_millis(250),
            readiness_max_backoff: Duration::from_secs(4),
            probe_timeout: Duration::from_secs(3),
            health_interval: Duration::from_secs(30),
            health_failure_threshold: 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub api_host: String,
    pub api_port: u16,
    /// Registry database. When unset the registry is kept in memory.
    pub database_url: Option<String>,
    pub registry_schema: String,
    /// Seals stored connection passwords. Without it a key is generated per process
    /// and sealed credentials do not survive a restart.
    pub secret_key: Option<SecretKey>,
    pub dispatch: DispatchSettings,
    pub introspection: IntrospectionSettings,
    pub lifecycle: LifecycleSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_host: "0.0.0.0".into(),
            api_port: 3000,
            database_url: None,
            registry_schema: "synth".into(),
            secret_key: None,
            dispatch: DispatchSettings::default(),
            introspection: IntrospectionSettings::default(),
            lifecycle: LifecycleSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = Settings::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("API_HOST") {
            s.api_host = v;
        }
        s.api_port = parse_or(&get, "API_PORT", s.api_port)?;
        s.database_url = get("DATABASE_URL");
        if let Some(v) = get("SYNTH_REGISTRY_SCHEMA") {
            if !is_identifier(&v) {
                return Err(ConfigError::Invalid { key: "SYNTH_REGISTRY_SCHEMA", value: v });
            }
            s.registry_schema = v;
        }

        if let Some(v) = get("SYNTH_SECRET_KEY") {
            let key: SecretKey = v.parse().map_err(|_| ConfigError::Invalid {
                key: "SYNTH_SECRET_KEY",
                value: "<redacted>".into(),
            })?;
            s.secret_key = Some(key);
        }

        let d = &mut s.dispatch;
        d.default_limit = parse_or(&get, "SYNTH_DEFAULT_LIMIT", d.default_limit)?;
        d.max_limit = parse_or(&get, "SYNTH_MAX_LIMIT", d.max_limit)?;
        d.pool_max_connections = parse_or(&get, "SYNTH_POOL_MAX_CONNECTIONS", d.pool_max_connections)?;
        d.acquire_timeout = secs_or(&get, "SYNTH_POOL_ACQUIRE_TIMEOUT_SECS", d.acquire_timeout)?;
        if d.default_limit == 0 || d.default_limit > d.max_limit {
            return Err(ConfigError::Invalid {
                key: "SYNTH_DEFAULT_LIMIT",
                value: d.default_limit.to_string(),
            });
        }

        s.introspection.connect_timeout =
            secs_or(&get, "SYNTH_CONNECT_TIMEOUT_SECS", s.introspection.connect_timeout)?;

        let l = &mut s.lifecycle;
        if let Some(v) = get("SYNTH_DOCKER_BIN") {
            l.docker_bin = v;
        }
        l.docker_timeout = secs_or(&get, "SYNTH_DOCKER_TIMEOUT_SECS", l.docker_timeout)?;
        if let Some(v) = get("SYNTH_DB_HOST") {
            l.db_host = v;
        }
        if let Some(v) = get("SYNTH_POSTGRES_IMAGE") {
            l.postgres_image = v;
        }
        if let Some(v) = get("SYNTH_MYSQL_IMAGE") {
            l.mysql_image = v;
        }
        l.port_range_start = parse_or(&get, "SYNTH_PORT_RANGE_START", l.port_range_start)?;
        l.port_range_end = parse_or(&get, "SYNTH_PORT_RANGE_END", l.port_range_end)?;
        if l.port_range_start == 0 || l.port_range_start > l.port_range_end {
            return Err(ConfigError::PortRange {
                start: l.port_range_start,
                end: l.port_range_end,
            });
        }
        l.memory_mb = parse_or(&get, "SYNTH_MEMORY_MB", l.memory_mb)?;
        l.cpu_share = parse_or(&get, "SYNTH_CPU_SHARE", l.cpu_share)?;
        if l.cpu_share.is_nan() || l.cpu_share <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "SYNTH_CPU_SHARE",
                value: l.cpu_share.to_string(),
            });
        }
        l.readiness_timeout = secs_or(&get, "SYNTH_READINESS_TIMEOUT_SECS", l.readiness_timeout)?;
        l.readiness_attempts = parse_or(&get, "SYNTH_READINESS_ATTEMPTS", l.readiness_attempts)?;
        l.health_interval = secs_or(&get, "SYNTH_HEALTH_INTERVAL_SECS", l.health_interval)?;
        l.health_failure_threshold =
            parse_or(&get, "SYNTH_HEALTH_FAILURE_THRESHOLD", l.health_failure_threshold)?;
        l.check_host_ports = parse_or(&get, "SYNTH_CHECK_HOST_PORTS", l.check_host_ports)?;

        Ok(s)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid { key, value: v }),
        None => Ok(default),
    }
}

fn secs_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::Invalid { key, value: v }),
        None => Ok(default),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let s = from_map(&[]).unwrap();
        assert_eq!(s.dispatch.default_limit, 50);
        assert_eq!(s.dispatch.max_limit, 1000);
        assert_eq!(s.lifecycle.memory_mb, 512);
        assert!(s.database_url.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let s = from_map(&[
            ("API_PORT", "8080"),
            ("SYNTH_PORT_RANGE_START", "7000"),
            ("SYNTH_PORT_RANGE_END", "7010"),
            ("SYNTH_READINESS_TIMEOUT_SECS", "5"),
            ("SYNTH_DOCKER_TIMEOUT_SECS", "30"),
            ("SYNTH_SECRET_KEY", "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8="),
        ])
        .unwrap();
        assert_eq!(s.lifecycle.docker_timeout, Duration::from_secs(30));
        assert!(s.secret_key.is_some());
        assert_eq!(s.bind_addr(), "0.0.0.0:8080");
        assert_eq!(s.lifecycle.port_range_start, 7000);
        assert_eq!(s.lifecycle.readiness_timeout, Duration::from_secs(5));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            from_map(&[("API_PORT", "http")]),
            Err(ConfigError::Invalid { key: "API_PORT", .. })
        ));
        assert!(matches!(
            from_map(&[("SYNTH_PORT_RANGE_START", "7000"), ("SYNTH_PORT_RANGE_END", "6000")]),
            Err(ConfigError::PortRange { .. })
        ));
        assert!(from_map(&[("SYNTH_REGISTRY_SCHEMA", "bad;schema")]).is_err());
        assert!(matches!(
            from_map(&[("SYNTH_SECRET_KEY", "too-short")]),
            Err(ConfigError::Invalid { key: "SYNTH_SECRET_KEY", .. })
        ));
    }
}
