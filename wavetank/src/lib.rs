//! # Wavetank Simulation Core
//!
//! A deterministic discrete-event simulation core for network applications.
//!
//! The crate provides:
//! - Logical time engine with event-driven time advancement
//! - Event queue with cancellable, generation-checked event handles
//! - Callback-completed socket abstraction for datagram and stream endpoints
//! - Application state machines (periodic sender, relay, sink, echo pair,
//!   link-cost updater) with a start/stop lifecycle
//! - A simulation driver that installs applications and runs the loop
//!
//! All "waiting" is modeled as a not-yet-dispatched event: there are no
//! threads and no blocking. Events at distinct timestamps dispatch in time
//! order; events at the same timestamp dispatch in scheduling order, which
//! makes runs reproducible for a fixed seed.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Application state machines built on sockets and events.
pub mod app;
/// Error types and utilities for simulation operations.
pub mod error;
/// Event scheduling, cancellation and ordering for the simulation engine.
pub mod events;
/// Network simulation: endpoints, configuration and the socket abstraction.
pub mod network;
/// Thread-local deterministic random number generation.
pub mod rng;
/// Simulation driver: application installation and scenario execution.
pub mod runner;
/// Core simulation world and the event dispatch loop.
pub mod sim;

// Public API exports
pub use app::{
    AppState, Application, EchoClient, EchoServer, LinkCostUpdater, PacketSink, PeriodicSender,
    Relay,
};
pub use error::{SimulationError, SimulationResult};
pub use events::EventId;
pub use network::{
    Endpoint, NetworkConfiguration, Socket, SocketId, SocketKind, SocketStatus, sample_duration,
};
pub use rng::{
    get_current_sim_seed, reset_sim_rng, set_sim_seed, sim_random, sim_random_range,
    sim_random_range_or_default,
};
pub use runner::{Simulation, SimulationMetrics};
pub use sim::{SimWorld, WeakSimWorld};
