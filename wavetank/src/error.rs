//! Error types for the simulation core.

use crate::network::Endpoint;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by scheduler, socket and application operations.
///
/// Scheduling and state errors are returned synchronously to the caller and
/// are expected to be handled locally; there is no global error sink in the
/// core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SimulationError {
    /// An absolute schedule target lies before the current simulation time.
    #[error("invalid delay: target time {target:?} is before current time {now:?}")]
    InvalidDelay {
        /// The requested dispatch time.
        target: Duration,
        /// The simulation time at the moment of the request.
        now: Duration,
    },

    /// The requested local endpoint is already bound by another socket.
    #[error("address already in use: {0}")]
    AddrInUse(Endpoint),

    /// The operation is not legal for the current socket or application state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A send was attempted on a socket that is not connected.
    #[error("socket is not connected")]
    NotConnected,

    /// An asynchronous connection attempt was refused by the network.
    #[error("connection failed")]
    ConnectFailed,

    /// The simulation world backing this handle has been dropped.
    #[error("simulation has been shut down")]
    SimulationShutdown,
}

/// Result alias for simulation operations.
pub type SimulationResult<T> = Result<T, SimulationError>;
