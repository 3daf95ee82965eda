//! Periodic datagram traffic generator.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::app::{AppState, Application};
use crate::events::EventId;
use crate::network::{Endpoint, Socket};
use crate::sim::SimWorld;

/// Sends a fixed-size datagram to a fixed peer every interval.
///
/// The first tick fires at start time; each tick sends one payload and
/// re-schedules itself, except when the optional packet budget is
/// exhausted. Stopping cancels the pending tick before closing the socket,
/// so no tick can outlive the application.
#[derive(Clone)]
pub struct PeriodicSender {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    local: Endpoint,
    peer: Endpoint,
    interval: Duration,
    payload_len: usize,
    max_packets: Option<u64>,
    socket: Option<Socket>,
    tick: Option<EventId>,
    sent: u64,
    state: AppState,
}

impl PeriodicSender {
    /// Creates a sender that transmits `payload_len`-byte datagrams from
    /// `local` to `peer` every `interval`, up to `max_packets` if given.
    pub fn new(
        local: Endpoint,
        peer: Endpoint,
        interval: Duration,
        payload_len: usize,
        max_packets: Option<u64>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                local,
                peer,
                interval,
                payload_len,
                max_packets,
                socket: None,
                tick: None,
                sent: 0,
                state: AppState::Stopped,
            })),
        }
    }

    /// Number of datagrams sent so far.
    pub fn packets_sent(&self) -> u64 {
        self.inner.borrow().sent
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AppState {
        self.inner.borrow().state
    }

    fn tick_callback(cell: &Rc<RefCell<Inner>>) -> impl FnOnce(&SimWorld) + 'static {
        let weak = Rc::downgrade(cell);
        move |sim| {
            if let Some(cell) = weak.upgrade() {
                Self::on_tick(&cell, sim);
            }
        }
    }

    fn on_tick(cell: &Rc<RefCell<Inner>>, sim: &SimWorld) {
        let mut inner = cell.borrow_mut();
        if inner.state != AppState::Running {
            return;
        }
        inner.tick = None;

        let socket = match &inner.socket {
            Some(socket) => socket.clone(),
            None => return,
        };
        let payload = Bytes::from(vec![0u8; inner.payload_len]);
        match socket.send(payload) {
            Ok(len) => {
                inner.sent += 1;
                debug!(seq = inner.sent, len, at = ?sim.current_time(), "periodic send");
            }
            Err(err) => warn!(%err, "periodic send failed"),
        }

        let budget_left = inner.max_packets.map_or(true, |max| inner.sent < max);
        if budget_left {
            inner.tick = Some(sim.schedule(inner.interval, Self::tick_callback(cell)));
        }
    }
}

impl Application for PeriodicSender {
    fn start(&self, sim: &SimWorld) {
        if self.inner.borrow().state == AppState::Running {
            return;
        }
        let (local, peer) = {
            let inner = self.inner.borrow();
            (inner.local, inner.peer)
        };

        let socket = sim.udp_socket();
        if let Err(err) = socket.bind(local) {
            warn!(%err, %local, "periodic sender failed to bind");
            return;
        }
        if let Err(err) = socket.connect(peer) {
            warn!(%err, %peer, "periodic sender failed to set peer");
            return;
        }

        let mut inner = self.inner.borrow_mut();
        inner.state = AppState::Running;
        inner.sent = 0;
        inner.socket = Some(socket);
        // First tick at the start time itself.
        inner.tick = Some(sim.schedule(Duration::ZERO, Self::tick_callback(&self.inner)));
        debug!(%local, %peer, "periodic sender started");
    }

    fn stop(&self, sim: &SimWorld) {
        let (tick, socket) = {
            let mut inner = self.inner.borrow_mut();
            inner.state = AppState::Stopped;
            (inner.tick.take(), inner.socket.take())
        };
        // Cancel outstanding events before closing sockets.
        if let Some(id) = tick {
            sim.cancel(id);
        }
        if let Some(socket) = socket {
            let _ = socket.close();
        }
        debug!("periodic sender stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetworkConfiguration;

    #[test]
    fn double_start_is_idempotent() {
        let mut sim = SimWorld::new_with_network_config(NetworkConfiguration::fast_local());
        let sender = PeriodicSender::new(
            Endpoint::v4(10, 0, 0, 1, 9),
            Endpoint::v4(10, 0, 0, 2, 9),
            Duration::from_secs(1),
            32,
            Some(1),
        );

        sender.start(&sim);
        sender.start(&sim); // Guarded by the Running state.

        sim.run_until_empty();
        assert_eq!(sender.packets_sent(), 1);
    }

    #[test]
    fn budget_stops_rescheduling() {
        let mut sim = SimWorld::new_with_network_config(NetworkConfiguration::fast_local());
        let sender = PeriodicSender::new(
            Endpoint::v4(10, 0, 0, 1, 9),
            Endpoint::v4(10, 0, 0, 2, 9),
            Duration::from_millis(10),
            16,
            Some(3),
        );

        sender.start(&sim);
        sim.run_until_empty();

        assert_eq!(sender.packets_sent(), 3);
        // No orphaned tick may survive the budget.
        assert!(!sim.has_pending_events());
    }
}
