//! Counting receiver application.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::app::{AppState, Application};
use crate::network::{Endpoint, Socket};
use crate::sim::SimWorld;

/// Terminates traffic: counts every received datagram and records its
/// arrival time.
#[derive(Clone)]
pub struct PacketSink {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    listen: Endpoint,
    socket: Option<Socket>,
    packets: u64,
    bytes: u64,
    arrivals: Vec<Duration>,
    state: AppState,
}

impl PacketSink {
    /// Creates a sink listening on `listen`.
    pub fn new(listen: Endpoint) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                listen,
                socket: None,
                packets: 0,
                bytes: 0,
                arrivals: Vec::new(),
                state: AppState::Stopped,
            })),
        }
    }

    /// Number of datagrams received.
    pub fn packets_received(&self) -> u64 {
        self.inner.borrow().packets
    }

    /// Total payload bytes received.
    pub fn bytes_received(&self) -> u64 {
        self.inner.borrow().bytes
    }

    /// Virtual arrival time of every received datagram, in order.
    pub fn arrival_times(&self) -> Vec<Duration> {
        self.inner.borrow().arrivals.clone()
    }

    fn on_recv(cell: &Rc<RefCell<Inner>>, socket: &Socket, now: Duration) {
        let mut inner = cell.borrow_mut();
        if inner.state != AppState::Running {
            return;
        }
        while let Ok(Some((payload, from))) = socket.recv_from() {
            inner.packets += 1;
            inner.bytes += payload.len() as u64;
            inner.arrivals.push(now);
            debug!(
                %from,
                len = payload.len(),
                at = ?now,
                total = inner.packets,
                "sink received payload"
            );
        }
    }
}

impl Application for PacketSink {
    fn start(&self, sim: &SimWorld) {
        if self.inner.borrow().state == AppState::Running {
            return;
        }
        let listen = self.inner.borrow().listen;

        let socket = sim.udp_socket();
        if let Err(err) = socket.bind(listen) {
            warn!(%err, %listen, "sink failed to bind");
            return;
        }

        let weak = Rc::downgrade(&self.inner);
        let weak_sim = sim.downgrade();
        let register = socket.set_recv_callback(move |socket| {
            if let Some(cell) = weak.upgrade() {
                let now = weak_sim.current_time().unwrap_or_default();
                PacketSink::on_recv(&cell, &socket, now);
            }
        });
        if let Err(err) = register {
            warn!(%err, "sink failed to register receive callback");
            return;
        }

        let mut inner = self.inner.borrow_mut();
        inner.state = AppState::Running;
        inner.socket = Some(socket);
        debug!(%listen, "sink started");
    }

    fn stop(&self, _sim: &SimWorld) {
        let socket = {
            let mut inner = self.inner.borrow_mut();
            inner.state = AppState::Stopped;
            inner.socket.take()
        };
        if let Some(socket) = socket {
            let _ = socket.close();
        }
        debug!("sink stopped");
    }
}
