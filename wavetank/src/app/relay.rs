//! Datagram relay application.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::app::{AppState, Application};
use crate::network::{Endpoint, Socket};
use crate::sim::SimWorld;

/// Forwards every datagram received on a listening socket to a fixed
/// downstream endpoint through a second, already-connected socket.
///
/// Forwarding happens inside the receive callback at the same virtual time
/// as the receive; no events are scheduled in the steady state, only the
/// downstream delivery itself.
#[derive(Clone)]
pub struct Relay {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    listen: Endpoint,
    upstream_local: Endpoint,
    downstream: Endpoint,
    listen_socket: Option<Socket>,
    upstream_socket: Option<Socket>,
    forwarded: u64,
    state: AppState,
}

impl Relay {
    /// Creates a relay that listens on `listen` and forwards every payload
    /// to `downstream`, sending from `upstream_local`.
    pub fn new(listen: Endpoint, upstream_local: Endpoint, downstream: Endpoint) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                listen,
                upstream_local,
                downstream,
                listen_socket: None,
                upstream_socket: None,
                forwarded: 0,
                state: AppState::Stopped,
            })),
        }
    }

    /// Number of payloads forwarded downstream.
    pub fn packets_forwarded(&self) -> u64 {
        self.inner.borrow().forwarded
    }

    fn on_recv(cell: &Rc<RefCell<Inner>>, socket: &Socket) {
        let mut inner = cell.borrow_mut();
        if inner.state != AppState::Running {
            return;
        }
        let upstream = match &inner.upstream_socket {
            Some(socket) => socket.clone(),
            None => return,
        };
        while let Ok(Some((payload, from))) = socket.recv_from() {
            match upstream.send(payload) {
                Ok(len) => {
                    inner.forwarded += 1;
                    debug!(%from, len, "relayed payload downstream");
                }
                Err(err) => warn!(%err, %from, "relay failed to forward"),
            }
        }
    }
}

impl Application for Relay {
    fn start(&self, sim: &SimWorld) {
        if self.inner.borrow().state == AppState::Running {
            return;
        }
        let (listen, upstream_local, downstream) = {
            let inner = self.inner.borrow();
            (inner.listen, inner.upstream_local, inner.downstream)
        };

        let listen_socket = sim.udp_socket();
        if let Err(err) = listen_socket.bind(listen) {
            warn!(%err, %listen, "relay failed to bind listening socket");
            return;
        }

        let upstream_socket = sim.udp_socket();
        if let Err(err) = upstream_socket.bind(upstream_local) {
            warn!(%err, %upstream_local, "relay failed to bind upstream socket");
            return;
        }
        if let Err(err) = upstream_socket.connect(downstream) {
            warn!(%err, %downstream, "relay failed to set downstream peer");
            return;
        }

        let weak = Rc::downgrade(&self.inner);
        let register = listen_socket.set_recv_callback(move |socket| {
            if let Some(cell) = weak.upgrade() {
                Relay::on_recv(&cell, &socket);
            }
        });
        if let Err(err) = register {
            warn!(%err, "relay failed to register receive callback");
            return;
        }

        let mut inner = self.inner.borrow_mut();
        inner.state = AppState::Running;
        inner.forwarded = 0;
        inner.listen_socket = Some(listen_socket);
        inner.upstream_socket = Some(upstream_socket);
        debug!(%listen, %downstream, "relay started");
    }

    fn stop(&self, _sim: &SimWorld) {
        // No steady-state events to cancel; just release the sockets.
        let (listen_socket, upstream_socket) = {
            let mut inner = self.inner.borrow_mut();
            inner.state = AppState::Stopped;
            (inner.listen_socket.take(), inner.upstream_socket.take())
        };
        if let Some(socket) = listen_socket {
            let _ = socket.close();
        }
        if let Some(socket) = upstream_socket {
            let _ = socket.close();
        }
        debug!("relay stopped");
    }
}
