//! Dynamic link-cost control loop.

use std::cell::RefCell;
use std::ops::Range;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::app::{AppState, Application};
use crate::events::EventId;
use crate::network::{Endpoint, Socket};
use crate::rng::sim_random_range_or_default;
use crate::sim::SimWorld;

/// Periodically recomputes a scalar link cost and pushes it downstream.
///
/// The canonical control-loop-on-a-timer variant: each tick draws a
/// jittered cost (`base_cost` plus a uniform term from the deterministic
/// RNG, floored at 1), encodes it big-endian and sends it to the peer,
/// then re-schedules itself. Cost changes are logged; unchanged ticks only
/// trace.
#[derive(Clone)]
pub struct LinkCostUpdater {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    local: Endpoint,
    peer: Endpoint,
    interval: Duration,
    base_cost: u32,
    jitter: Range<u32>,
    socket: Option<Socket>,
    tick: Option<EventId>,
    cost: u32,
    updates_sent: u64,
    state: AppState,
}

impl LinkCostUpdater {
    /// Creates an updater advertising `base_cost` plus a uniform draw from
    /// `jitter` to `peer` every `interval`.
    pub fn new(
        local: Endpoint,
        peer: Endpoint,
        interval: Duration,
        base_cost: u32,
        jitter: Range<u32>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                local,
                peer,
                interval,
                base_cost,
                jitter,
                socket: None,
                tick: None,
                cost: 0,
                updates_sent: 0,
                state: AppState::Stopped,
            })),
        }
    }

    /// The most recently advertised cost.
    pub fn current_cost(&self) -> u32 {
        self.inner.borrow().cost
    }

    /// Number of cost updates pushed downstream.
    pub fn updates_sent(&self) -> u64 {
        self.inner.borrow().updates_sent
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

        let new_cost =
            (inner.base_cost + sim_random_range_or_default(inner.jitter.clone())).max(1);
        if new_cost != inner.cost {
            debug!(old = inner.cost, new = new_cost, "link cost changed");
            inner.cost = new_cost;
        } else {
            trace!(cost = inner.cost, "link cost unchanged");
        }

        let payload = Bytes::copy_from_slice(&inner.cost.to_be_bytes());
        match socket.send(payload) {
            Ok(_) => inner.updates_sent += 1,
            Err(err) => warn!(%err, "cost update send failed"),
        }

        inner.tick = Some(sim.schedule(inner.interval, Self::tick_callback(cell)));
    }
}

impl Application for LinkCostUpdater {
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
            warn!(%err, %local, "cost updater failed to bind");
            return;
        }
        if let Err(err) = socket.connect(peer) {
            warn!(%err, %peer, "cost updater failed to set peer");
            return;
        }

        let mut inner = self.inner.borrow_mut();
        inner.state = AppState::Running;
        inner.updates_sent = 0;
        inner.socket = Some(socket);
        inner.tick = Some(sim.schedule(Duration::ZERO, Self::tick_callback(&self.inner)));
        debug!(%local, %peer, base = inner.base_cost, "cost updater started");
    }

    fn stop(&self, sim: &SimWorld) {
        let (tick, socket) = {
            let mut inner = self.inner.borrow_mut();
            inner.state = AppState::Stopped;
            (inner.tick.take(), inner.socket.take())
        };
        if let Some(id) = tick {
            sim.cancel(id);
        }
        if let Some(socket) = socket {
            let _ = socket.close();
        }
        debug!("cost updater stopped");
    }
}
