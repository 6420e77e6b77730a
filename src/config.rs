//! Configuration loading, backend specification parsing, and validation.
//!
//! The selector is configured exactly once at startup. A raw [`Config`] is
//! read from YAML, then validated into a [`RuntimeConfig`] that holds the
//! parsed backend addresses and every default already applied, so nothing
//! on the connection path has to touch the filesystem or re-parse strings.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::Algorithm;
use crate::{Result, SelectorError};

/// Default socket address the forwarding loop binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8100";

/// Default number of consecutive failures before a backend is suspended.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default length of a suspension.
pub const DEFAULT_FAIL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect timeout the caller applies when dialing a backend.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Raw configuration as deserialized from the YAML file.
///
/// This struct maps directly to the on-disk schema. After loading, it is
/// transformed into a [`RuntimeConfig`] holding validated backends.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Socket address the proxy listens on (default `"127.0.0.1:8100"`).
    #[serde(default)]
    pub listen: Option<String>,
    /// Comma-separated `host:port` list, e.g. `"web1:80,web2:80"`.
    #[serde(default)]
    pub backends: String,
    /// Selection policy (default `round_robin`).
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
    /// Consecutive failures before a backend is suspended (default: 3).
    #[serde(default)]
    pub passive_failure_threshold: Option<u32>,
    /// How long a suspended backend stays out of rotation, in seconds
    /// (default: 30).
    #[serde(default)]
    pub fail_timeout_secs: Option<u64>,
    /// Connect timeout in milliseconds for dialing a backend (default: 5000).
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Period in seconds of the JSON pool status log. Absent disables it.
    #[serde(default)]
    pub status_interval_secs: Option<u64>,
}

/// The address of a single backend, as parsed from the backend specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddr {
    /// Host name or literal address. IPv6 literals are stored unbracketed.
    pub host: String,
    /// TCP port, never zero.
    pub port: u16,
}

impl BackendAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for BackendAddr {
    type Err = SelectorError;

    fn from_str(entry: &str) -> Result<Self> {
        parse_backend(entry.trim())
    }
}

/// Parses a comma-separated list of `host:port` pairs.
///
/// Input order is preserved and duplicates are kept as distinct entries.
/// An empty (or whitespace-only) specification yields an empty list.
pub fn parse_backends(spec: &str) -> Result<Vec<BackendAddr>> {
    if spec.trim().is_empty() {
        return Ok(Vec::new());
    }

    spec.split(',')
        .map(|entry| parse_backend(entry.trim()))
        .collect()
}

/// Validates a single trimmed `host:port` entry.
fn parse_backend(entry: &str) -> Result<BackendAddr> {
    if entry.is_empty() {
        return Err(SelectorError::InvalidBackend(
            "empty entry in backend list".into(),
        ));
    }

    let (host, port) = entry.rsplit_once(':').ok_or_else(|| {
        SelectorError::InvalidBackend(format!("missing port in \"{entry}\""))
    })?;

    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']').ok_or_else(|| {
            SelectorError::InvalidBackend(format!("unterminated IPv6 literal in \"{entry}\""))
        })?,
        None if host.contains(':') => {
            return Err(SelectorError::InvalidBackend(format!(
                "IPv6 hosts must be bracketed: \"{entry}\""
            )));
        }
        None => host,
    };

    if host.is_empty() {
        return Err(SelectorError::InvalidBackend(format!(
            "missing host in \"{entry}\""
        )));
    }

    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SelectorError::InvalidBackend(format!(
            "non-numeric port in \"{entry}\""
        )));
    }

    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| {
            SelectorError::InvalidBackend(format!("port out of range 1-65535 in \"{entry}\""))
        })?;

    Ok(BackendAddr::new(host, port))
}

/// Construction parameters of a [`Selector`](crate::Selector).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorConfig {
    /// Selection policy, fixed for the lifetime of the selector.
    pub algorithm: Algorithm,
    /// Consecutive failures before a backend is suspended. Always positive.
    pub passive_failure_threshold: u32,
    /// How long a suspended backend stays excluded.
    pub fail_timeout: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            passive_failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            fail_timeout: DEFAULT_FAIL_TIMEOUT,
        }
    }
}

/// Fully validated, ready-to-use configuration.
#[derive(Debug)]
pub struct RuntimeConfig {
    /// Socket address the forwarding loop binds to.
    pub listen: SocketAddr,
    /// Parsed backend addresses in configuration order.
    pub backends: Vec<BackendAddr>,
    /// Selector construction parameters.
    pub selector: SelectorConfig,
    /// Connect timeout applied by the caller, never by the selector.
    pub connect_timeout: Duration,
    /// Period of the JSON pool status log. `None` disables it.
    pub status_interval: Option<Duration>,
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    ///
    /// Returns a [`SelectorError::Config`] if the file cannot be opened or
    /// its contents fail YAML deserialization.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            SelectorError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| SelectorError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates all fields and parses the backend specification, producing
    /// a [`RuntimeConfig`].
    ///
    /// At least one backend must be configured.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        let backends = parse_backends(&self.backends)?;
        if backends.is_empty() {
            return Err(SelectorError::Config(
                "at least one backend must be configured".into(),
            ));
        }

        let listen_str = self.listen.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
        let listen = listen_str.parse::<SocketAddr>().map_err(|e| {
            SelectorError::Config(format!("invalid listen address \"{listen_str}\": {e}"))
        })?;

        let passive_failure_threshold = self
            .passive_failure_threshold
            .unwrap_or(DEFAULT_FAILURE_THRESHOLD);
        if passive_failure_threshold == 0 {
            return Err(SelectorError::Config(
                "passive_failure_threshold must be positive".into(),
            ));
        }

        let fail_timeout = self
            .fail_timeout_secs
            .map_or(DEFAULT_FAIL_TIMEOUT, Duration::from_secs);

        let connect_timeout = self
            .connect_timeout_ms
            .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_millis);

        let status_interval = match self.status_interval_secs {
            Some(0) => {
                return Err(SelectorError::Config(
                    "status_interval_secs must be positive".into(),
                ));
            }
            other => other.map(Duration::from_secs),
        };

        Ok(RuntimeConfig {
            listen,
            backends,
            selector: SelectorConfig {
                algorithm: self.algorithm.unwrap_or_default(),
                passive_failure_threshold,
                fail_timeout,
            },
            connect_timeout,
            status_interval,
        })
    }
}
