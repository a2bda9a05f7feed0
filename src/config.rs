//! Configuration management for the Abacate CLI.
//!
//! Optional defaults are read from `config.toml` in the platform config
//! directory. Command-line flags take precedence over the file, the file over
//! built-in defaults. The result is a single [`Settings`] record handed to
//! each component at startup.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cli::Cli;
use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::relay::{
    ForwardConfig, RelayConfig, DEFAULT_DRAIN_GRACE, DEFAULT_MAX_IN_FLIGHT,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::tunnel::{
    RelayProtocol, TunnelConfig, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_LOCAL_PORT, DEFAULT_RELAY_HOST,
};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub forward: ForwardSection,
    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TunnelSection {
    pub host: Option<String>,
    pub subdomain: Option<String>,
    pub protocol: Option<RelayProtocol>,
    pub port: Option<u16>,
    pub handshake_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ForwardSection {
    pub timeout_secs: Option<u64>,
    /// Accept invalid TLS certificates from an https target
    pub allow_invalid_cert: Option<bool>,
    pub max_in_flight: Option<usize>,
    pub drain_grace_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LogSection {
    pub enabled: Option<bool>,
    pub prefix: Option<bool>,
    pub time: Option<bool>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "abacate").context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

/// The local server requests are forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    base_url: String,
}

impl Target {
    /// Validate an absolute http(s) URL. A trailing slash is dropped so that
    /// request paths can be appended as-is.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigError::MissingTarget);
        }

        let invalid = |reason: String| ConfigError::InvalidTarget {
            url: raw.to_string(),
            reason,
        };

        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "unsupported scheme '{}', expected http:// or https://",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }

        Ok(Self {
            base_url: raw.trim_end_matches('/').to_string(),
        })
    }

    /// `base_url + path`
    pub fn join(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_url)
    }
}

/// Everything the process needs, resolved once at startup
#[derive(Debug, Clone)]
pub struct Settings {
    pub target: Target,
    pub listen_port: u16,
    pub tunnel: TunnelConfig,
    pub forward: ForwardConfig,
    pub relay: RelayConfig,
    pub log: LogConfig,
}

impl Settings {
    pub fn resolve(cli: &Cli, file: &Config) -> Result<Self, ConfigError> {
        let target = Target::parse(cli.target.as_deref().unwrap_or_default())?;

        let relay_host = cli
            .host
            .clone()
            .or_else(|| file.tunnel.host.clone())
            .unwrap_or_else(|| DEFAULT_RELAY_HOST.to_string());
        Url::parse(&relay_host).map_err(|e| ConfigError::InvalidRelayHost {
            url: relay_host.clone(),
            reason: e.to_string(),
        })?;

        let listen_port = cli
            .port
            .or(file.tunnel.port)
            .unwrap_or(DEFAULT_LOCAL_PORT);

        let tunnel = TunnelConfig {
            local_port: listen_port,
            requested_subdomain: cli
                .subdomain
                .clone()
                .or_else(|| file.tunnel.subdomain.clone())
                .filter(|s| !s.trim().is_empty()),
            relay_host,
            protocol: cli.protocol.or(file.tunnel.protocol).unwrap_or_default(),
            handshake_timeout: file
                .tunnel
                .handshake_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT),
            idle_timeout: file
                .tunnel
                .idle_timeout_secs
                .map(|secs| Duration::from_secs(secs.max(1)))
                .unwrap_or(DEFAULT_IDLE_TIMEOUT),
        };

        let forward = ForwardConfig {
            timeout: cli
                .timeout
                .or(file.forward.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            allow_invalid_cert: !cli.strict_cert
                && file.forward.allow_invalid_cert.unwrap_or(true),
        };

        let relay = RelayConfig {
            max_in_flight: cli
                .max_in_flight
                .or(file.forward.max_in_flight)
                .unwrap_or(DEFAULT_MAX_IN_FLIGHT)
                .max(1),
            drain_grace: file
                .forward
                .drain_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_DRAIN_GRACE),
        };

        let log = LogConfig {
            enabled: cli.logger.or(file.log.enabled).unwrap_or(true),
            prefix: cli.log_prefix.or(file.log.prefix).unwrap_or(true),
            time: cli.log_time.or(file.log.time).unwrap_or(true),
            verbose: cli.verbose,
        };

        Ok(Self {
            target,
            listen_port,
            tunnel,
            forward,
            relay,
            log,
        })
    }
}
