// Broker configuration
//
// Listener endpoints, request timeout and dereference limits. Hosts can
// embed this in their own config file; the binary builds it from flags.

use std::env;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;
use voltron_adaptor::deref::{DerefLimits, DEFAULT_MAX_DEREF, DEFAULT_MAX_STRING};

pub const DEFAULT_PORT: u16 = 5555;
pub const DEFAULT_BASENAME: &str = "voltron";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest basename used in the socket file name
pub const MAX_BASENAME: usize = 16;

pub const SOCKET_ENV: &str = "VOLTRON_SOCKET";
pub const BASENAME_ENV: &str = "VOLTRON_BASENAME";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_deref must be at least 1")]
    ZeroDerefCap,

    #[error("max_string must be at least 1")]
    ZeroStringCap,
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// `None` disables the TCP listener
    pub tcp: Option<SocketAddr>,
    /// `None` disables the domain socket listener
    pub domain: Option<PathBuf>,
    pub basename: String,
    #[serde(deserialize_with = "seconds")]
    pub default_timeout: Duration,
    pub max_deref: usize,
    pub max_string: usize,
    /// View names reported by `plugins`
    pub views: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tcp: Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_PORT))),
            domain: socket_path(DEFAULT_BASENAME),
            basename: DEFAULT_BASENAME.to_string(),
            default_timeout: DEFAULT_TIMEOUT,
            max_deref: DEFAULT_MAX_DEREF,
            max_string: DEFAULT_MAX_STRING,
            views: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Defaults with `VOLTRON_BASENAME` and `VOLTRON_SOCKET` applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(basename) = env::var(BASENAME_ENV) {
            config.set_basename(&basename);
        }
        if let Ok(path) = env::var(SOCKET_ENV) {
            config.domain = Some(PathBuf::from(path));
        }
        config
    }

    /// Change the basename and the default socket path derived from it
    pub fn set_basename(&mut self, basename: &str) {
        self.basename = truncate_basename(basename);
        self.domain = socket_path(&self.basename);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_deref == 0 {
            return Err(ConfigError::ZeroDerefCap);
        }
        if self.max_string == 0 {
            return Err(ConfigError::ZeroStringCap);
        }
        Ok(())
    }

    pub fn deref_limits(&self) -> DerefLimits {
        DerefLimits {
            max_deref: self.max_deref,
            max_string: self.max_string,
        }
    }
}

fn truncate_basename(basename: &str) -> String {
    basename.chars().take(MAX_BASENAME).collect()
}

/// `~/.voltron/<basename>.sock`
pub fn socket_path(basename: &str) -> Option<PathBuf> {
    let home = home::home_dir()?;
    Some(
        home.join(".voltron")
            .join(format!("{}.sock", truncate_basename(basename))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.tcp, Some("127.0.0.1:5555".parse().unwrap()));
        assert_eq!(config.default_timeout, Duration::from_secs(10));
        assert_eq!(config.deref_limits(), DerefLimits::default());
        if let Some(domain) = &config.domain {
            assert!(domain.ends_with(".voltron/voltron.sock"));
        }
    }

    #[test]
    fn test_basename_is_truncated() {
        let mut config = BrokerConfig::default();
        config.set_basename("a-really-long-debugger-session-name");
        assert_eq!(config.basename, "a-really-long-de");
        if let Some(domain) = &config.domain {
            assert_eq!(domain.file_name().unwrap(), "a-really-long-de.sock");
        }
    }

    #[test]
    fn test_zero_caps_are_rejected() {
        let mut config = BrokerConfig::default();
        assert_eq!(config.validate(), Ok(()));

        config.max_deref = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroDerefCap));

        config.max_deref = 1;
        config.max_string = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroStringCap));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: BrokerConfig =
            serde_json::from_str(r#"{"tcp": null, "default_timeout": 2.5, "max_deref": 24}"#).unwrap();
        assert_eq!(config.tcp, None);
        assert_eq!(config.default_timeout, Duration::from_millis(2500));
        assert_eq!(config.max_deref, 24);
        assert_eq!(config.basename, "voltron");
    }
}
