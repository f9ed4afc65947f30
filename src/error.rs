//! Unified error type for the core infrastructure substrates.

use std::fmt;
use std::time::Duration;

/// Errors surfaced by the circuit breaker, load balancer, DB manager, and hub.
#[derive(Debug)]
pub enum CoreError {
    /// The circuit breaker is open and rejected the call without invoking it.
    BreakerOpen { name: String },
    /// `ExecuteWithTimeout` did not receive a result before its deadline.
    BreakerTimeout { name: String, elapsed: Duration },
    /// The load balancer has no healthy instance to return.
    InstanceUnavailable { service: String },
    /// A named pool could not be opened or reconnected.
    DbConnect { name: String, reason: String },
    /// A ping against an established pool failed.
    DbPing { name: String, reason: String },
    /// A hub client's send buffer was full; it has been evicted.
    SlowConsumer { client_id: String },
    /// An inbound hub message failed to parse.
    MalformedMessage { reason: String },
    /// A WebSocket upgrade was attempted without prior authentication.
    UnauthorizedUpgrade,
    /// No pool is registered under the requested name.
    UnknownPool { name: String },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BreakerOpen { name } => write!(f, "circuit breaker \"{name}\" is open"),
            Self::BreakerTimeout { name, elapsed } => {
                write!(f, "circuit breaker \"{name}\" timed out after {elapsed:?}")
            }
            Self::InstanceUnavailable { service } => {
                write!(f, "no healthy instance available for service \"{service}\"")
            }
            Self::DbConnect { name, reason } => {
                write!(f, "failed to connect pool \"{name}\": {reason}")
            }
            Self::DbPing { name, reason } => {
                write!(f, "ping failed for pool \"{name}\": {reason}")
            }
            Self::SlowConsumer { client_id } => {
                write!(f, "client \"{client_id}\" evicted as a slow consumer")
            }
            Self::MalformedMessage { reason } => write!(f, "malformed message: {reason}"),
            Self::UnauthorizedUpgrade => write!(f, "websocket upgrade missing authentication"),
            Self::UnknownPool { name } => write!(f, "no pool registered under \"{name}\""),
        }
    }
}

impl std::error::Error for CoreError {}

impl CoreError {
    /// True if this is a breaker-related rejection (open or timeout).
    pub fn is_breaker(&self) -> bool {
        matches!(self, Self::BreakerOpen { .. } | Self::BreakerTimeout { .. })
    }

    /// True if the load balancer had nothing healthy to offer.
    pub fn is_instance_unavailable(&self) -> bool {
        matches!(self, Self::InstanceUnavailable { .. })
    }

    /// True if this originated from the DB manager.
    pub fn is_db(&self) -> bool {
        matches!(
            self,
            Self::DbConnect { .. } | Self::DbPing { .. } | Self::UnknownPool { .. }
        )
    }

    /// True if this originated from the hub.
    pub fn is_hub(&self) -> bool {
        matches!(
            self,
            Self::SlowConsumer { .. } | Self::MalformedMessage { .. } | Self::UnauthorizedUpgrade
        )
    }
}

/// Convenience alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;
