//! Backend selection policies and passive health feedback.
//!
//! A [`Selector`] picks one healthy backend per inbound connection from a
//! fixed [`Registry`], using one of three policies fixed at construction:
//!
//! - **round robin**: scans forward from a shared cursor and leaves the
//!   cursor just past the backend it returned;
//! - **least connections**: the healthy backend with the fewest routed
//!   connections, ties going to the earliest registry position;
//! - **IP hash**: an FNV-1a hash of the client identifier selects a home
//!   backend, falling forward to the next healthy one while it is suspended.
//!
//! The selector performs no I/O. Callers report each connection outcome
//! through [`Selector::mark_success`] or [`Selector::mark_failure`], which
//! drive the per-backend suspension state machine.

use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SelectorConfig;
use crate::upstream::{saturating_millis, Backend, Registry};
use crate::{Result, SelectorError};

/// Selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    IpHash,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::IpHash => "ip_hash",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "least_connections" => Ok(Self::LeastConnections),
            "ip_hash" => Ok(Self::IpHash),
            other => Err(SelectorError::Config(format!(
                "unknown algorithm \"{other}\", expected round_robin, least_connections or ip_hash"
            ))),
        }
    }
}

/// Picks backends from a [`Registry`] and applies connection feedback.
///
/// Selection and feedback are lock-free and safe to call concurrently from
/// any number of connection handlers. Cloning yields a handle sharing the
/// same registry and round-robin cursor.
#[derive(Debug, Clone)]
pub struct Selector {
    registry: Registry,
    config: SelectorConfig,
    /// Next round-robin candidate, always less than the registry length.
    cursor: Arc<AtomicUsize>,
}

impl Selector {
    /// Creates a selector over `registry`. A zero failure threshold is
    /// raised to one.
    pub fn new(registry: Registry, mut config: SelectorConfig) -> Self {
        config.passive_failure_threshold = config.passive_failure_threshold.max(1);
        Self {
            registry,
            config,
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn algorithm(&self) -> Algorithm {
        self.config.algorithm
    }

    /// Picks a healthy backend for `client`, evaluating health now.
    pub fn pick(&self, client: &str) -> Result<Backend> {
        self.pick_at(client, Instant::now())
    }

    /// Picks a healthy backend for `client`, evaluating health at `now`.
    ///
    /// `client` only matters for [`Algorithm::IpHash`]. Returns
    /// [`SelectorError::NoBackendAvailable`] if the registry is empty or
    /// every backend is suspended; scanning is bounded by one pass over
    /// the registry.
    pub fn pick_at(&self, client: &str, now: Instant) -> Result<Backend> {
        if self.registry.is_empty() {
            return Err(SelectorError::NoBackendAvailable);
        }

        let picked = match self.config.algorithm {
            Algorithm::RoundRobin => self.round_robin(now),
            Algorithm::LeastConnections => self.least_connections(now),
            Algorithm::IpHash => self.ip_hash(client, now),
        };

        match picked {
            Some(backend) => Ok(backend.clone()),
            None => {
                debug!(
                    algorithm = %self.config.algorithm,
                    backends = self.registry.len(),
                    "every backend is suspended"
                );
                Err(SelectorError::NoBackendAvailable)
            }
        }
    }

    /// Reports a failed connection to `backend`.
    pub fn mark_failure(&self, backend: &Backend) {
        self.mark_failure_at(backend, Instant::now());
    }

    /// Reports a failed connection to `backend` observed at `now`, suspending
    /// it for the fail timeout once the failure threshold is reached.
    pub fn mark_failure_at(&self, backend: &Backend, now: Instant) {
        let suspended = backend.record_failure_at(
            self.config.passive_failure_threshold,
            self.config.fail_timeout,
            now,
        );

        if suspended {
            warn!(
                backend = %backend.addr(),
                fails = backend.fails(),
                fail_timeout_ms = saturating_millis(self.config.fail_timeout),
                "backend suspended after consecutive failures"
            );
        } else {
            debug!(
                backend = %backend.addr(),
                fails = backend.fails(),
                "backend connection failed"
            );
        }
    }

    /// Reports a successful connection to `backend`, resetting its failure
    /// count. An active suspension runs to its deadline regardless.
    pub fn mark_success(&self, backend: &Backend) {
        let fails = backend.fails();
        backend.record_success();
        if fails > 0 {
            debug!(
                backend = %backend.addr(),
                previous_fails = fails,
                "failure count reset after success"
            );
        }
    }

    fn round_robin(&self, now: Instant) -> Option<&Backend> {
        let backends = self.registry.all();
        let len = backends.len();
        let mut start = self.cursor.load(Ordering::Acquire);

        loop {
            let found = (0..len)
                .map(|offset| (start + offset) % len)
                .find(|&idx| backends[idx].is_healthy_at(now))?;

            match self.cursor.compare_exchange_weak(
                start,
                (found + 1) % len,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(&backends[found]),
                Err(current) => start = current,
            }
        }
    }

    fn least_connections(&self, now: Instant) -> Option<&Backend> {
        // `min_by_key` keeps the first of equal minima.
        self.registry
            .all()
            .iter()
            .filter(|b| b.is_healthy_at(now))
            .min_by_key(|b| b.active_connections())
    }

    fn ip_hash(&self, client: &str, now: Instant) -> Option<&Backend> {
        let backends = self.registry.all();
        let len = backends.len();
        let home = (hash_client(client) % len as u64) as usize;

        (0..len)
            .map(|offset| &backends[(home + offset) % len])
            .find(|b| b.is_healthy_at(now))
    }
}

/// Stable 64-bit FNV-1a hash of a client identifier.
fn hash_client(client: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(client.as_bytes());
    hasher.finish()
}
