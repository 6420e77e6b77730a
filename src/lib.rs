//!
//! Backend selection with passive health tracking, for use by TCP and HTTP
//! load balancers.
//!
//! A [`Registry`] holds a fixed, ordered set of backends parsed from a
//! `host1:port1,host2:port2` specification. A [`Selector`] picks a healthy
//! backend per connection using round robin, least connections, or IP hash,
//! and suspends backends that fail repeatedly until their fail timeout
//! elapses. The [`server`] module drives a selector from a plain TCP
//! forwarding loop.

pub mod balancer;
pub mod config;
pub mod error;
pub mod server;
pub mod upstream;

pub use balancer::{Algorithm, Selector};
pub use config::{parse_backends, BackendAddr, Config, RuntimeConfig, SelectorConfig};
pub use error::SelectorError;
pub use upstream::{Backend, BackendStatus, ConnectionGuard, Registry, Suspension};

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, SelectorError>;
