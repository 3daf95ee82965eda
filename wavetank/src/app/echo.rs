//! Stream request/response pair: echo server and client.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::app::{AppState, Application};
use crate::events::EventId;
use crate::network::{Endpoint, Socket};
use crate::sim::{SimWorld, WeakSimWorld};

/// Accepts stream connections and echoes every received payload back on
/// the same connection.
#[derive(Clone)]
pub struct EchoServer {
    inner: Rc<RefCell<ServerInner>>,
}

struct ServerInner {
    listen: Endpoint,
    listener: Option<Socket>,
    connections: Vec<Socket>,
    echoed: u64,
    state: AppState,
}

impl EchoServer {
    /// Creates a server listening on `listen`.
    pub fn new(listen: Endpoint) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ServerInner {
                listen,
                listener: None,
                connections: Vec::new(),
                echoed: 0,
                state: AppState::Stopped,
            })),
        }
    }

    /// Number of payloads echoed back.
    pub fn payloads_echoed(&self) -> u64 {
        self.inner.borrow().echoed
    }

    /// Number of accepted connections.
    pub fn connections_accepted(&self) -> usize {
        self.inner.borrow().connections.len()
    }

    fn on_accept(cell: &Rc<RefCell<ServerInner>>, connection: Socket, peer: Endpoint) {
        {
            let inner = cell.borrow();
            if inner.state != AppState::Running {
                return;
            }
        }
        debug!(%peer, "echo server accepted connection");

        let weak = Rc::downgrade(cell);
        let register = connection.set_recv_callback(move |socket| {
            if let Some(cell) = weak.upgrade() {
                EchoServer::on_connection_recv(&cell, &socket);
            }
        });
        if let Err(err) = register {
            warn!(%err, "echo server failed to register connection callback");
            return;
        }
        cell.borrow_mut().connections.push(connection);
    }

    fn on_connection_recv(cell: &Rc<RefCell<ServerInner>>, socket: &Socket) {
        let mut inner = cell.borrow_mut();
        if inner.state != AppState::Running {
            return;
        }
        while let Ok(Some((payload, from))) = socket.recv_from() {
            match socket.send(payload) {
                Ok(len) => {
                    inner.echoed += 1;
                    debug!(%from, len, "echoed payload");
                }
                Err(err) => warn!(%err, "echo send failed"),
            }
        }
    }
}

impl Application for EchoServer {
    fn start(&self, sim: &SimWorld) {
        if self.inner.borrow().state == AppState::Running {
            return;
        }
        let listen = self.inner.borrow().listen;

        let listener = sim.tcp_socket();
        if let Err(err) = listener.bind(listen) {
            warn!(%err, %listen, "echo server failed to bind");
            return;
        }
        if let Err(err) = listener.listen() {
            warn!(%err, "echo server failed to listen");
            return;
        }

        let weak = Rc::downgrade(&self.inner);
        let register = listener.set_accept_callback(move |connection, peer| {
            if let Some(cell) = weak.upgrade() {
                EchoServer::on_accept(&cell, connection, peer);
            }
        });
        if let Err(err) = register {
            warn!(%err, "echo server failed to register accept callback");
            return;
        }

        let mut inner = self.inner.borrow_mut();
        inner.state = AppState::Running;
        inner.listener = Some(listener);
        debug!(%listen, "echo server started");
    }

    fn stop(&self, _sim: &SimWorld) {
        let (listener, connections) = {
            let mut inner = self.inner.borrow_mut();
            inner.state = AppState::Stopped;
            (
                inner.listener.take(),
                std::mem::take(&mut inner.connections),
            )
        };
        for connection in connections {
            let _ = connection.close();
        }
        if let Some(listener) = listener {
            let _ = listener.close();
        }
        debug!("echo server stopped");
    }
}

/// Stream client that connects, sends one request per tick and counts the
/// echoed responses.
///
/// A refused connection surfaces through the failure callback exactly once
/// and leaves the socket closed: the client records the failure and never
/// attempts a send, and any send forced afterwards fails synchronously
/// with [`crate::SimulationError::NotConnected`].
#[derive(Clone)]
pub struct EchoClient {
    inner: Rc<RefCell<ClientInner>>,
}

struct ClientInner {
    local: Endpoint,
    server: Endpoint,
    payload_len: usize,
    interval: Duration,
    max_requests: u64,
    socket: Option<Socket>,
    tick: Option<EventId>,
    requests_sent: u64,
    responses_received: u64,
    connect_failed: bool,
    state: AppState,
}

impl EchoClient {
    /// Creates a client that sends `max_requests` requests of
    /// `payload_len` bytes to `server`, one per `interval`, from `local`.
    pub fn new(
        local: Endpoint,
        server: Endpoint,
        payload_len: usize,
        interval: Duration,
        max_requests: u64,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ClientInner {
                local,
                server,
                payload_len,
                interval,
                max_requests,
                socket: None,
                tick: None,
                requests_sent: 0,
                responses_received: 0,
                connect_failed: false,
                state: AppState::Stopped,
            })),
        }
    }

    /// Number of requests sent.
    pub fn requests_sent(&self) -> u64 {
        self.inner.borrow().requests_sent
    }

    /// Number of echoed responses received.
    pub fn responses_received(&self) -> u64 {
        self.inner.borrow().responses_received
    }

    /// Whether the connection attempt was refused.
    pub fn connect_failed(&self) -> bool {
        self.inner.borrow().connect_failed
    }

    /// The client's socket, for state inspection in scenarios.
    pub fn socket(&self) -> Option<Socket> {
        self.inner.borrow().socket.clone()
    }

    fn tick_callback(cell: &Rc<RefCell<ClientInner>>) -> impl FnOnce(&SimWorld) + 'static {
        let weak = Rc::downgrade(cell);
        move |sim| {
            if let Some(cell) = weak.upgrade() {
                Self::on_tick(&cell, sim);
            }
        }
    }

    fn on_tick(cell: &Rc<RefCell<ClientInner>>, sim: &SimWorld) {
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
                inner.requests_sent += 1;
                debug!(seq = inner.requests_sent, len, "echo request sent");
            }
            Err(err) => {
                warn!(%err, "echo request failed");
                return;
            }
        }

        if inner.requests_sent < inner.max_requests {
            inner.tick = Some(sim.schedule(inner.interval, Self::tick_callback(cell)));
        }
    }

    fn on_connected(cell: &Rc<RefCell<ClientInner>>, sim: &WeakSimWorld) {
        let mut inner = cell.borrow_mut();
        if inner.state != AppState::Running {
            return;
        }
        debug!("echo client connected");
        if let Ok(id) = sim.schedule(Duration::ZERO, Self::tick_callback(cell)) {
            inner.tick = Some(id);
        }
    }
}

impl Application for EchoClient {
    fn start(&self, sim: &SimWorld) {
        if self.inner.borrow().state == AppState::Running {
            return;
        }
        let (local, server) = {
            let inner = self.inner.borrow();
            (inner.local, inner.server)
        };

        let socket = sim.tcp_socket();
        if let Err(err) = socket.bind(local) {
            warn!(%err, %local, "echo client failed to bind");
            return;
        }

        let weak = Rc::downgrade(&self.inner);
        let weak_sim = sim.downgrade();
        let on_success = move |_socket: Socket| {
            if let Some(cell) = weak.upgrade() {
                EchoClient::on_connected(&cell, &weak_sim);
            }
        };
        let weak = Rc::downgrade(&self.inner);
        let on_failure = move |_socket: Socket, err| {
            if let Some(cell) = weak.upgrade() {
                warn!(%err, "echo client connection refused");
                cell.borrow_mut().connect_failed = true;
            }
        };
        if let Err(err) = socket.set_connect_callbacks(on_success, on_failure) {
            warn!(%err, "echo client failed to register connect callbacks");
            return;
        }

        let weak = Rc::downgrade(&self.inner);
        let register = socket.set_recv_callback(move |socket| {
            if let Some(cell) = weak.upgrade() {
                let mut inner = cell.borrow_mut();
                if inner.state != AppState::Running {
                    return;
                }
                while let Ok(Some((payload, _from))) = socket.recv_from() {
                    inner.responses_received += 1;
                    debug!(
                        len = payload.len(),
                        total = inner.responses_received,
                        "echo response received"
                    );
                }
            }
        });
        if let Err(err) = register {
            warn!(%err, "echo client failed to register receive callback");
            return;
        }

        if let Err(err) = socket.connect(server) {
            warn!(%err, %server, "echo client failed to start connect");
            return;
        }

        let mut inner = self.inner.borrow_mut();
        inner.state = AppState::Running;
        inner.socket = Some(socket);
        debug!(%local, %server, "echo client started");
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
        debug!("echo client stopped");
    }
}
