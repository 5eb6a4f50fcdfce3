//! Service configuration, read once from `FLEET_*` environment variables.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub max_pool_size: u32,
    pub allowed_origins: Option<Vec<String>>,
    pub request_timeout: Duration,
}

/// Environment variables as envy sees them, before defaults are resolved.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    fleet_listen_addr: Option<String>,
    fleet_listen_host: Option<String>,
    fleet_listen_port: Option<u16>,
    fleet_database_url: Option<String>,
    /// Conventional fallback shared with migration tooling.
    database_url: Option<String>,
    fleet_max_pool_size: Option<u32>,
    fleet_allowed_origins: Option<String>,
    fleet_request_timeout_secs: Option<u64>,
}

impl RawConfig {
    /// `FLEET_LISTEN_ADDR` verbatim, otherwise `host:port` with defaults filled in.
    fn listen_target(&self) -> (String, &'static str) {
        match &self.fleet_listen_addr {
            Some(addr) => (addr.trim().to_string(), "FLEET_LISTEN_ADDR"),
            None => {
                let host = self.fleet_listen_host.as_deref().unwrap_or(DEFAULT_HOST);
                let port = self.fleet_listen_port.unwrap_or(DEFAULT_PORT);
                (format!("{host}:{port}"), "FLEET_LISTEN_HOST/FLEET_LISTEN_PORT")
            }
        }
    }

    fn listen_addr(&self) -> Result<SocketAddr> {
        let (target, source) = self.listen_target();
        if let Ok(addr) = target.parse::<SocketAddr>() {
            return Ok(addr);
        }

        // Hostnames such as `localhost` need a lookup; take the first answer.
        target
            .to_socket_addrs()
            .with_context(|| format!("{source} '{target}' is not a listen address"))?
            .next()
            .with_context(|| format!("{source} '{target}' resolved to nothing"))
    }

    fn database_url(&self) -> Result<String> {
        let url = [&self.fleet_database_url, &self.database_url]
            .into_iter()
            .flatten()
            .map(|url| url.trim())
            .find(|url| !url.is_empty());

        match url {
            Some(url) => Ok(url.to_string()),
            None => bail!("FLEET_DATABASE_URL or DATABASE_URL must be set"),
        }
    }

    fn allowed_origins(&self) -> Option<Vec<String>> {
        let origins: Vec<String> = self
            .fleet_allowed_origins
            .as_deref()?
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(String::from)
            .collect();

        (!origins.is_empty()).then_some(origins)
    }
}

impl TryFrom<RawConfig> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(raw: RawConfig) -> Result<Self> {
        Ok(Self {
            listen_addr: raw.listen_addr()?,
            database_url: raw.database_url()?,
            max_pool_size: raw.fleet_max_pool_size.unwrap_or(10).max(1),
            allowed_origins: raw.allowed_origins(),
            request_timeout: Duration::from_secs(
                raw.fleet_request_timeout_secs.unwrap_or(30).max(1),
            ),
        })
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse FLEET_* environment variables")?;
        Self::try_from(raw)
    }

    /// Configuration for in-process use (tests, local tooling) where nothing is bound.
    pub fn embedded(database_url: String) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            database_url,
            max_pool_size: 1,
            allowed_origins: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawConfig {
        RawConfig {
            fleet_database_url: Some("postgres://fleet@localhost/fleet".into()),
            ..RawConfig::default()
        }
    }

    #[test]
    fn defaults_bind_all_interfaces_on_8080() {
        let config = AppConfig::try_from(raw()).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.max_pool_size, 10);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.allowed_origins.is_none());
    }

    #[test]
    fn explicit_addr_wins_over_host_and_port() {
        let raw = RawConfig {
            fleet_listen_addr: Some(" 127.0.0.1:9000 ".into()),
            fleet_listen_host: Some("10.0.0.1".into()),
            fleet_listen_port: Some(1),
            ..raw()
        };
        let config = AppConfig::try_from(raw).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn host_and_port_are_combined() {
        let raw = RawConfig {
            fleet_listen_host: Some("127.0.0.1".into()),
            fleet_listen_port: Some(3001),
            ..raw()
        };
        let config = AppConfig::try_from(raw).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3001".parse().unwrap());
    }

    #[test]
    fn unparseable_listen_addr_names_its_variable() {
        let raw = RawConfig {
            fleet_listen_addr: Some("not an address".into()),
            ..raw()
        };
        let err = AppConfig::try_from(raw).unwrap_err();
        assert!(err.to_string().contains("FLEET_LISTEN_ADDR"), "{err}");
    }

    #[test]
    fn origins_are_trimmed_and_blank_entries_dropped() {
        let raw = RawConfig {
            fleet_allowed_origins: Some(" http://a.test , ,http://b.test".into()),
            ..raw()
        };
        let config = AppConfig::try_from(raw).unwrap();
        assert_eq!(
            config.allowed_origins,
            Some(vec!["http://a.test".to_string(), "http://b.test".to_string()])
        );

        let raw = RawConfig {
            fleet_allowed_origins: Some(" , ".into()),
            ..self::raw()
        };
        assert!(AppConfig::try_from(raw).unwrap().allowed_origins.is_none());
    }

    #[test]
    fn database_url_falls_back_to_generic_variable() {
        let raw = RawConfig {
            database_url: Some("postgres://other/db".into()),
            ..RawConfig::default()
        };
        let config = AppConfig::try_from(raw).unwrap();
        assert_eq!(config.database_url, "postgres://other/db");
    }

    #[test]
    fn missing_or_blank_database_url_is_an_error() {
        let err = AppConfig::try_from(RawConfig::default()).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"), "{err}");

        let raw = RawConfig {
            fleet_database_url: Some("  ".into()),
            ..RawConfig::default()
        };
        assert!(AppConfig::try_from(raw).is_err());
    }

    #[test]
    fn zero_pool_size_and_timeout_are_raised() {
        let raw = RawConfig {
            fleet_max_pool_size: Some(0),
            fleet_request_timeout_secs: Some(0),
            ..raw()
        };
        let config = AppConfig::try_from(raw).unwrap();
        assert_eq!(config.max_pool_size, 1);
        assert_eq!(config.request_timeout, Duration::from_secs(1));
    }
}
