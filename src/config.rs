use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::cli::Cli;
use crate::platform::{self, Platform};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid platform: {0}")]
    Platform(#[from] platform::ParseError),
    #[error("Invalid bind address `{0}`, expected host:port or :port.")]
    BindAddress(String),
    #[error("At least one worker is required.")]
    NoWorkers,
    #[error("The {0} must be greater than zero.")]
    ZeroDuration(&'static str),
}

/// What the exporter resolves and how long results stay fresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExporterConfig {
    /// Zero disables periodic re-resolution.
    pub cache_duration: Duration,
    pub platform:       Option<Platform>,
}

impl ExporterConfig {
    pub(crate) fn new(cache_duration: Duration, platform: &str) -> Result<Self, ConfigError> {
        let platform = if platform.trim().is_empty() { None } else { Some(platform.parse()?) };
        Ok(Self { cache_duration, platform })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Concurrent reconciles per watched kind.
    pub workers:           u16,
    /// Deadline of a single attempt.
    pub reconcile_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    pub timeout:             Duration,
    pub insecure_registries: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// `None` when the endpoint is disabled.
    pub metrics_address: Option<SocketAddr>,
    pub probe_address:   Option<SocketAddr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub exporter:   ExporterConfig,
    pub controller: ControllerConfig,
    pub registry:   RegistryConfig,
    pub server:     ServerConfig,
}

impl Config {
    pub(crate) fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        if cli.controller.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if cli.controller.reconcile_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("reconcile timeout"));
        }
        if cli.controller.registry_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("registry timeout"));
        }

        Ok(Self {
            exporter:   ExporterConfig::new(cli.cache_duration, &cli.platform)?,
            controller: ControllerConfig {
                workers:           cli.controller.workers,
                reconcile_timeout: cli.controller.reconcile_timeout,
            },
            registry:   RegistryConfig {
                timeout:             cli.controller.registry_timeout,
                insecure_registries: cli
                    .controller
                    .insecure_registries
                    .iter()
                    .map(|host| host.trim().to_owned())
                    .filter(|host| !host.is_empty())
                    .collect(),
            },
            server:     ServerConfig {
                metrics_address: parse_bind_address(&cli.metrics_bind_address)?,
                probe_address:   parse_bind_address(&cli.health_probe_bind_address)?,
            },
        })
    }
}

/// `:port` binds every interface, `0` disables the listener.
pub(crate) fn parse_bind_address(address: &str) -> Result<Option<SocketAddr>, ConfigError> {
    let address = address.trim();
    if address == "0" {
        return Ok(None);
    }
    if let Some(port) = address.strip_prefix(':') {
        let port = port.parse::<u16>().map_err(|_| ConfigError::BindAddress(address.to_owned()))?;
        return Ok(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)));
    }
    address
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::BindAddress(address.to_owned()))
}
