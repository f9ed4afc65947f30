#![forbid(unsafe_code)]

//! Infrastructure substrates for the campus penpal platform.
//!
//! - **Circuit breaker + registry** — generation-accounted breaker state
//!   machine with a named registry for sharing breakers across call sites.
//! - **Smart log aggregator** — fingerprints repeated log lines and
//!   progressively suppresses them under a verbose/silent/sampled/circuited
//!   state machine.
//! - **DB connection manager** — named PostgreSQL pools with lifecycle
//!   configuration and a background health prober.
//! - **Load balancer** — round robin, weighted round robin, least
//!   connections, session affinity, and adaptive instance selection, each
//!   instrumenting a per-instance circuit breaker.
//! - **Real-time hub** — WebSocket client sessions, room fan-out, presence,
//!   and bounded history behind a single dispatcher task.
//!
//! ## Quick start
//!
//! ```rust
//! use campus_core::circuit_breaker::{BreakerConfig, CircuitBreaker, ExecError};
//!
//! # async fn run() -> Result<(), ExecError<std::io::Error>> {
//! let breaker = CircuitBreaker::new("payments-api", BreakerConfig::default());
//! let result = breaker
//!     .execute(|| async { Ok::<_, std::io::Error>(42) })
//!     .await?;
//! assert_eq!(result, 42);
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod db;
pub mod error;
pub mod hub;
pub mod load_balancer;
pub mod log_aggregator;

pub use clock::{Clock, MonotonicClock};
pub use error::{CoreError, CoreResult};

use std::sync::OnceLock;

/// Process-wide circuit breaker registry. Per the breaker's concurrency
/// discipline, this is lazily initialized behind a `OnceLock` rather than a
/// static built at load time, so its creation never depends on module
/// initialization order.
pub fn default_breaker_registry() -> &'static circuit_breaker::Manager {
    static REGISTRY: OnceLock<circuit_breaker::Manager> = OnceLock::new();
    REGISTRY.get_or_init(circuit_breaker::Manager::new)
}

/// Process-wide DB connection manager, lazily initialized for the same
/// reason as [`default_breaker_registry`].
pub fn default_db_manager() -> &'static db::DbManager {
    static MANAGER: OnceLock<db::DbManager> = OnceLock::new();
    MANAGER.get_or_init(db::DbManager::new)
}

/// Process-wide load balancer registry, one [`load_balancer::LoadBalancer`]
/// per service name.
pub fn default_load_balancer_registry() -> &'static load_balancer::Manager {
    static REGISTRY: OnceLock<load_balancer::Manager> = OnceLock::new();
    REGISTRY.get_or_init(load_balancer::Manager::new)
}
