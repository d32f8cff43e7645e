//! Bridge settings: defaults, TOML file, environment overrides.

use super::env::{EnvError, EnvParser};
use crate::types::CallbackKind;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// How long a test waits for its VM to phone home.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(175);
/// Upper bound for reading one callback body.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;
pub const DEFAULT_CONNECTIVITY_PATH: &str = "/phonehome";
pub const DEFAULT_METADATA_PATH: &str = "/metadata";
/// Prefix reserved for the remote-wait endpoint.
pub const WAIT_PATH_PREFIX: &str = "/wait";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid environment configuration: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("Invalid callback endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// How the listener's accept loop is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServeMode {
    /// Answer one request, then stop.
    SingleShot,
    /// Serve until shut down.
    #[default]
    Forever,
}

impl std::fmt::Display for ServeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleShot => write!(f, "single_shot"),
            Self::Forever => write!(f, "forever"),
        }
    }
}

impl FromStr for ServeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single_shot" | "single-shot" | "once" => Ok(Self::SingleShot),
            "forever" => Ok(Self::Forever),
            other => Err(format!("unknown serve mode '{other}'")),
        }
    }
}

/// Settings for one bridge instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// URL the VMs are told to call. When set, the listen port comes from it.
    pub callback_endpoint: Option<String>,
    pub bind_address: IpAddr,
    /// Listen port used when no endpoint is configured. `0` picks a free port.
    pub port: u16,
    pub connectivity_path: String,
    pub metadata_path: String,
    #[serde(with = "duration_str")]
    pub wait_timeout: Duration,
    #[serde(with = "duration_str")]
    pub read_timeout: Duration,
    pub max_body_bytes: usize,
    pub mode: ServeMode,
    /// Idle limit for single-shot runs; defaults to `wait_timeout`.
    #[serde(with = "duration_str::option")]
    pub single_shot_timeout: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            callback_endpoint: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            connectivity_path: DEFAULT_CONNECTIVITY_PATH.to_string(),
            metadata_path: DEFAULT_METADATA_PATH.to_string(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            mode: ServeMode::Forever,
            single_shot_timeout: None,
        }
    }
}

impl BridgeConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load from `path`, or return defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `PHONEHOME_*` variables. All invalid variables are reported together.
    pub fn apply_env(&mut self, env: &mut EnvParser) -> Result<(), ConfigError> {
        if let Some(endpoint) = env.get_string("CALLBACK_ENDPOINT") {
            self.callback_endpoint = Some(endpoint);
        }
        if let Some(addr) = env.get_parsed::<IpAddr>("BIND_ADDRESS", "IP address") {
            self.bind_address = addr;
        }
        if let Some(port) = env.get_u16_range("PORT", 0, u16::MAX) {
            self.port = port;
        }
        if let Some(path) = env.get_string("CONNECTIVITY_PATH") {
            self.connectivity_path = path;
        }
        if let Some(path) = env.get_string("METADATA_PATH") {
            self.metadata_path = path;
        }
        if let Some(timeout) = env.get_duration("WAIT_TIMEOUT") {
            self.wait_timeout = timeout;
        }
        if let Some(timeout) = env.get_duration("READ_TIMEOUT") {
            self.read_timeout = timeout;
        }
        if let Some(max) = env.get_u64_range("MAX_BODY_BYTES", 1, 64 * 1024 * 1024) {
            self.max_body_bytes = usize::try_from(max).unwrap_or(DEFAULT_MAX_BODY_BYTES);
        }
        if let Some(mode) = env.get_parsed::<ServeMode>("MODE", "single_shot or forever") {
            self.mode = mode;
        }
        if let Some(timeout) = env.get_duration("SINGLE_SHOT_TIMEOUT") {
            self.single_shot_timeout = Some(timeout);
        }

        if env.has_errors() {
            return Err(ConfigError::Env(env.take_errors()));
        }
        Ok(())
    }

    /// Port to listen on, derived from the callback endpoint when one is set.
    pub fn listen_port(&self) -> Result<u16, ConfigError> {
        let Some(endpoint) = self.callback_endpoint.as_deref() else {
            return Ok(self.port);
        };
        let parsed = url::Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        parsed
            .port_or_known_default()
            .ok_or_else(|| ConfigError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: "no port and no default port for scheme".to_string(),
            })
    }

    /// Socket address the listener binds.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_address, self.listen_port()?))
    }

    /// Route serving callbacks of `kind`.
    pub fn path_for(&self, kind: CallbackKind) -> &str {
        match kind {
            CallbackKind::Connectivity => &self.connectivity_path,
            CallbackKind::Metadata => &self.metadata_path,
        }
    }

    pub fn effective_single_shot_timeout(&self) -> Duration {
        self.single_shot_timeout.unwrap_or(self.wait_timeout)
    }

    /// Check settings that would otherwise fail at bind or route time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for kind in CallbackKind::ALL {
            let path = self.path_for(kind);
            if !path.starts_with('/') || path.len() < 2 {
                return Err(ConfigError::Invalid(format!(
                    "{kind} path '{path}' must start with '/' and name a resource"
                )));
            }
            if path.contains(['{', '}', ':', '*']) {
                return Err(ConfigError::Invalid(format!(
                    "{kind} path '{path}' must not contain route parameters"
                )));
            }
            if path == WAIT_PATH_PREFIX || path.starts_with(&format!("{WAIT_PATH_PREFIX}/")) {
                return Err(ConfigError::Invalid(format!(
                    "{kind} path '{path}' collides with the reserved {WAIT_PATH_PREFIX} route"
                )));
            }
        }
        if self.connectivity_path == self.metadata_path {
            return Err(ConfigError::Invalid(
                "connectivity and metadata paths must differ".to_string(),
            ));
        }
        if self.wait_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        if self.single_shot_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Invalid(
                "single_shot_timeout must be non-zero".to_string(),
            ));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_body_bytes must be non-zero".to_string(),
            ));
        }
        self.listen_port()?;
        Ok(())
    }
}

/// Durations stored as humantime strings (`"175s"`, `"2m 30s"`).
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(raw.trim()).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => super::serialize(d, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            let raw = Option::<String>::deserialize(d)?;
            raw.map(|r| humantime::parse_duration(r.trim()).map_err(D::Error::custom))
                .transpose()
        }
    }
}
