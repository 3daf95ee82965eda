//! Application state machines built on sockets and events.
//!
//! An application is a protocol behavior unit with a two-state lifecycle:
//! `Stopped -> Running -> Stopped`. The driver invokes [`Application::start`]
//! and [`Application::stop`] as scheduled events at the configured times.
//! Behavior selection happens at configuration time by picking a concrete
//! type; there is no inheritance hierarchy.
//!
//! Two rules keep teardown safe, and every application here follows them:
//! every steady-state callback checks for `Running` before acting or
//! re-scheduling itself, and `stop` cancels outstanding events before
//! closing sockets.

use crate::sim::SimWorld;

/// Dynamic link-cost control loop.
pub mod cost;
/// Stream request/response pair.
pub mod echo;
/// Periodic datagram traffic generator.
pub mod periodic;
/// Datagram forwarder.
pub mod relay;
/// Counting receiver.
pub mod sink;

pub use cost::LinkCostUpdater;
pub use echo::{EchoClient, EchoServer};
pub use periodic::PeriodicSender;
pub use relay::Relay;
pub use sink::PacketSink;

/// Lifecycle state of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// Not started, or torn down.
    Stopped,
    /// Started and reacting to events.
    Running,
}

/// A protocol behavior unit with a start/stop lifecycle.
///
/// Implementations own their sockets and pending event handles. Both
/// methods must be idempotent: the driver may deliver a second start or
/// stop, and a double stop must leave the same end state as a single one
/// (no sockets, no pending events, `Stopped`).
pub trait Application {
    /// Brings the application up: opens and binds sockets, registers
    /// callbacks, schedules the first protocol event.
    fn start(&self, sim: &SimWorld);

    /// Tears the application down: cancels every outstanding event it
    /// holds, then closes every owned socket, then transitions to
    /// `Stopped`, in that order, so no cancelled event can fire into a
    /// closed socket.
    fn stop(&self, sim: &SimWorld);
}
