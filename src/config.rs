use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a valid {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("both SLOTD_TLS_CERT and SLOTD_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Server configuration loaded from `SLOTD_*` environment variables.
///
/// | Env Var                            | Default   |
/// |------------------------------------|-----------|
/// | `SLOTD_BIND`                       | `0.0.0.0` |
/// | `SLOTD_PORT`                       | `5433`    |
/// | `SLOTD_DATA_DIR`                   | `./data`  |
/// | `SLOTD_API_KEY`                    | `slotd`   |
/// | `SLOTD_MAX_CONNECTIONS`            | `256`     |
/// | `SLOTD_COMPACT_THRESHOLD`          | `1000`    |
/// | `SLOTD_RESERVATION_RETENTION_SECS` | `86400`   |
/// | `SLOTD_SWEEP_INTERVAL_SECS`        | `30`      |
/// | `SLOTD_DRAIN_TIMEOUT_SECS`         | `10`      |
/// | `SLOTD_METRICS_PORT`               | unset     |
/// | `SLOTD_TLS_CERT` / `SLOTD_TLS_KEY` | unset     |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub api_key: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub reservation_retention: Duration,
    pub sweep_interval: Duration,
    pub drain_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            api_key: "slotd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            reservation_retention: Duration::from_secs(86_400),
            sweep_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            metrics_port: None,
            tls: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let tls = match (lookup("SLOTD_TLS_CERT"), lookup("SLOTD_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::PartialTls),
        };

        Ok(Self {
            bind: lookup("SLOTD_BIND").unwrap_or(defaults.bind),
            port: parse_var(&lookup, "SLOTD_PORT", "port number")?.unwrap_or(defaults.port),
            data_dir: lookup("SLOTD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            api_key: lookup("SLOTD_API_KEY").unwrap_or(defaults.api_key),
            max_connections: parse_var(&lookup, "SLOTD_MAX_CONNECTIONS", "usize")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "SLOTD_COMPACT_THRESHOLD", "u64")?
                .unwrap_or(defaults.compact_threshold),
            reservation_retention: parse_var(&lookup, "SLOTD_RESERVATION_RETENTION_SECS", "u64")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.reservation_retention),
            sweep_interval: parse_var(&lookup, "SLOTD_SWEEP_INTERVAL_SECS", "u64")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            drain_timeout: parse_var(&lookup, "SLOTD_DRAIN_TIMEOUT_SECS", "u64")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.drain_timeout),
            metrics_port: parse_var(&lookup, "SLOTD_METRICS_PORT", "port number")?,
            tls,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, expected, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup_from(&[
            ("SLOTD_PORT", "6000"),
            ("SLOTD_API_KEY", "secret"),
            ("SLOTD_RESERVATION_RETENTION_SECS", "60"),
            ("SLOTD_METRICS_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.api_key, "secret");
        assert_eq!(config.reservation_retention, Duration::from_secs(60));
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn bad_number_is_reported() {
        let err = Config::from_lookup(lookup_from(&[("SLOTD_MAX_CONNECTIONS", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "SLOTD_MAX_CONNECTIONS",
                expected: "usize",
                value: "lots".into(),
            }
        );
    }

    #[test]
    fn tls_requires_both_paths() {
        let err = Config::from_lookup(lookup_from(&[("SLOTD_TLS_CERT", "cert.pem")])).unwrap_err();
        assert_eq!(err, ConfigError::PartialTls);

        let config = Config::from_lookup(lookup_from(&[
            ("SLOTD_TLS_CERT", "cert.pem"),
            ("SLOTD_TLS_KEY", "key.pem"),
        ]))
        .unwrap();
        assert_eq!(config.tls.unwrap().key, PathBuf::from("key.pem"));
    }
}
