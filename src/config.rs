//! Server configuration loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device listener bind address.
    pub addr: String,
    /// HTTP API bind address.
    pub http_addr: String,
    /// PEM certificate chain for the device listener; TLS is enabled when
    /// both `tls_cert` and `tls_key` are set.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub ping_interval_ms: u64,
    pub exchange_timeout_ms: u64,
    pub session_queue_size: usize,
    pub max_sessions: usize,
    pub max_request_body_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9090".to_string(),
            http_addr: "127.0.0.1:8080".to_string(),
            tls_cert: None,
            tls_key: None,
            ping_interval_ms: 30_000,
            exchange_timeout_ms: 5_000,
            session_queue_size: 10,
            max_sessions: 1_000,
            max_request_body_bytes: 4_096,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exchange_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "exchange_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.ping_interval_ms <= self.exchange_timeout_ms {
            return Err(ConfigError::Invalid(
                "ping_interval_ms must exceed exchange_timeout_ms".to_string(),
            ));
        }
        if self.session_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "session_queue_size must be > 0".to_string(),
            ));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be > 0".to_string()));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::Invalid(
                "tls_cert and tls_key must be set together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn load_merges_partial_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.toml");
        std::fs::write(&path, "addr = \"0.0.0.0:9090\"\nmax_sessions = 5\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.addr, "0.0.0.0:9090");
        assert_eq!(config.max_sessions, 5);
        assert_eq!(
            config.session_queue_size,
            Config::default().session_queue_size
        );
    }

    #[test]
    fn ping_interval_must_exceed_exchange_timeout() {
        let config = Config {
            ping_interval_ms: 1_000,
            exchange_timeout_ms: 1_000,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn tls_paths_must_pair() {
        let config = Config {
            tls_cert: Some(PathBuf::from("cert.pem")),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
