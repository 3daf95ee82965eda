//! The application-facing socket handle and the socket operations of the
//! simulation world.
//!
//! A [`Socket`] is a cheap handle (weak world reference plus id); the real
//! state lives in the world's [`crate::network::state::NetworkState`].
//! Every operation that would block in a real stack is represented as a
//! scheduled event: connects, sends and deliveries complete through the
//! event queue and surface via the registered callbacks.

use std::mem;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{SimulationError, SimulationResult};
use crate::network::config::sample_duration;
use crate::network::state::{
    AcceptCallback, ConnectCallback, SocketCallbacks, SocketState,
};
use crate::network::{Endpoint, SocketId, SocketKind, SocketStatus};
use crate::sim::{SimWorld, WeakSimWorld};

fn unknown_socket(id: SocketId) -> SimulationError {
    SimulationError::InvalidState(format!("{id} does not exist"))
}

fn invalid_state(msg: impl Into<String>) -> SimulationError {
    SimulationError::InvalidState(msg.into())
}

/// An asynchronous network endpoint.
///
/// Sockets never block: `connect` and `send` enqueue work whose completion
/// is signaled through callbacks, and `recv_from` only pulls payloads that
/// a scheduled delivery event has already placed in the ready queue.
///
/// A socket is owned by exactly one application. Closing it releases the
/// endpoint binding and clears every registered callback, so no callback is
/// ever invoked on a closed socket.
#[derive(Debug, Clone)]
pub struct Socket {
    sim: WeakSimWorld,
    id: SocketId,
}

impl Socket {
    pub(crate) fn new(sim: WeakSimWorld, id: SocketId) -> Self {
        Self { sim, id }
    }

    /// Identifier of this socket within its simulation world.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Binds the socket to a local endpoint.
    ///
    /// Fails with [`SimulationError::AddrInUse`] if another socket already
    /// holds the endpoint.
    pub fn bind(&self, local: Endpoint) -> SimulationResult<()> {
        self.sim.upgrade()?.socket_bind(self.id, local)
    }

    /// Starts accepting inbound stream connections on a bound socket.
    ///
    /// Accepted connections surface through the callback registered with
    /// [`Socket::set_accept_callback`].
    pub fn listen(&self) -> SimulationResult<()> {
        self.sim.upgrade()?.socket_listen(self.id)
    }

    /// Connects to a peer endpoint.
    ///
    /// For stream sockets the transition to `Connected` (or `Closed`) is
    /// asynchronous: the outcome arrives via the callbacks registered with
    /// [`Socket::set_connect_callbacks`] after the sampled connection
    /// latency. For datagram sockets this is a synchronous local operation
    /// that only fixes the default peer for [`Socket::send`].
    pub fn connect(&self, peer: Endpoint) -> SimulationResult<()> {
        self.sim.upgrade()?.socket_connect(self.id, peer)
    }

    /// Queues a payload to the connected peer, returning the number of
    /// bytes queued.
    ///
    /// Completion is signaled asynchronously through the sent callback once
    /// the simulated transmission occurs. Fails with
    /// [`SimulationError::NotConnected`] when no peer is fixed (datagram)
    /// or the connection is not established (stream).
    pub fn send(&self, payload: Bytes) -> SimulationResult<usize> {
        self.sim.upgrade()?.socket_send(self.id, payload)
    }

    /// Queues a datagram to an explicit destination endpoint.
    pub fn send_to(&self, payload: Bytes, dest: Endpoint) -> SimulationResult<usize> {
        self.sim.upgrade()?.socket_send_to(self.id, payload, dest)
    }

    /// Pulls one already-arrived payload from the ready queue.
    ///
    /// Returns `Ok(None)` when nothing is waiting. Arrival itself is driven
    /// by scheduled delivery events, which also trigger the recv callback.
    pub fn recv_from(&self) -> SimulationResult<Option<(Bytes, Endpoint)>> {
        self.sim.upgrade()?.socket_recv_from(self.id)
    }

    /// Closes the socket: releases the binding, clears all callbacks and,
    /// for an established stream, notifies the peer after the close-notify
    /// latency. Double-close is a no-op.
    pub fn close(&self) -> SimulationResult<()> {
        self.sim.upgrade()?.socket_close(self.id)
    }

    /// Current position in the socket state machine.
    pub fn status(&self) -> SimulationResult<SocketStatus> {
        self.sim.upgrade()?.socket_status(self.id)
    }

    /// The bound local endpoint, if any.
    pub fn local_endpoint(&self) -> SimulationResult<Option<Endpoint>> {
        self.sim
            .upgrade()?
            .with_socket(self.id, |sock| sock.local)
    }

    /// The connected or default peer endpoint, if any.
    pub fn peer_endpoint(&self) -> SimulationResult<Option<Endpoint>> {
        self.sim.upgrade()?.with_socket(self.id, |sock| sock.peer)
    }

    /// Registers the callback invoked when a payload arrives.
    pub fn set_recv_callback(
        &self,
        callback: impl FnMut(Socket) + 'static,
    ) -> SimulationResult<()> {
        self.sim
            .upgrade()?
            .socket_replace_callback(self.id, Box::new(callback) as _, |c| &mut c.on_recv)
    }

    /// Registers the callback invoked with each accepted stream connection
    /// and the peer's endpoint.
    pub fn set_accept_callback(
        &self,
        callback: impl FnMut(Socket, Endpoint) + 'static,
    ) -> SimulationResult<()> {
        self.sim
            .upgrade()?
            .socket_replace_callback(self.id, Box::new(callback) as _, |c| &mut c.on_accept)
    }

    /// Registers the pair of callbacks for an asynchronous connect:
    /// `succeeded` fires on establishment, `failed` fires exactly once with
    /// [`SimulationError::ConnectFailed`] when the peer is unreachable.
    pub fn set_connect_callbacks(
        &self,
        succeeded: impl FnMut(Socket) + 'static,
        failed: impl FnMut(Socket, SimulationError) + 'static,
    ) -> SimulationResult<()> {
        let sim = self.sim.upgrade()?;
        sim.socket_replace_callback(self.id, Box::new(succeeded) as _, |c| {
            &mut c.on_connect_succeeded
        })?;
        sim.socket_replace_callback(self.id, Box::new(failed) as _, |c| &mut c.on_connect_failed)
    }

    /// Registers the callback invoked when a queued payload has been
    /// transmitted, with the number of bytes sent.
    pub fn set_sent_callback(
        &self,
        callback: impl FnMut(Socket, usize) + 'static,
    ) -> SimulationResult<()> {
        self.sim
            .upgrade()?
            .socket_replace_callback(self.id, Box::new(callback) as _, |c| &mut c.on_sent)
    }

    /// Registers the callback invoked when the stream peer closes the
    /// connection.
    pub fn set_close_callback(
        &self,
        callback: impl FnMut(Socket) + 'static,
    ) -> SimulationResult<()> {
        self.sim
            .upgrade()?
            .socket_replace_callback(self.id, Box::new(callback) as _, |c| &mut c.on_close)
    }
}

enum SendMode {
    Datagram {
        dest: Endpoint,
        from: Endpoint,
        delay: Duration,
    },
    Stream {
        dst: SocketId,
        from: Endpoint,
        delay: Duration,
    },
}

enum ConnectOutcome {
    Succeeded {
        listener: SocketId,
        server: SocketId,
        client_local: Endpoint,
        accept_cb: Option<AcceptCallback>,
        succeeded_cb: Option<ConnectCallback>,
    },
    Failed {
        callbacks: SocketCallbacks,
    },
    Ignore,
}

impl SimWorld {
    /// Creates an unbound datagram socket.
    pub fn udp_socket(&self) -> Socket {
        self.create_socket(SocketKind::Datagram)
    }

    /// Creates an unbound stream socket.
    pub fn tcp_socket(&self) -> Socket {
        self.create_socket(SocketKind::Stream)
    }

    fn create_socket(&self, kind: SocketKind) -> Socket {
        let id = self.with_inner(|inner| {
            let id = SocketId(inner.network.next_socket_id);
            inner.network.next_socket_id += 1;
            inner.network.sockets.insert(id, SocketState::new(id, kind));
            id
        });
        debug!(%id, ?kind, "created socket");
        Socket::new(self.downgrade(), id)
    }

    pub(crate) fn socket_handle(&self, id: SocketId) -> Socket {
        Socket::new(self.downgrade(), id)
    }

    fn with_socket<R>(
        &self,
        id: SocketId,
        f: impl FnOnce(&SocketState) -> R,
    ) -> SimulationResult<R> {
        self.with_inner(|inner| {
            inner
                .network
                .sockets
                .get(&id)
                .map(f)
                .ok_or_else(|| unknown_socket(id))
        })
    }

    pub(crate) fn socket_status(&self, id: SocketId) -> SimulationResult<SocketStatus> {
        self.with_socket(id, |sock| sock.status)
    }

    pub(crate) fn socket_bind(&self, id: SocketId, local: Endpoint) -> SimulationResult<()> {
        self.with_inner(|inner| {
            let status = inner
                .network
                .sockets
                .get(&id)
                .map(|sock| sock.status)
                .ok_or_else(|| unknown_socket(id))?;
            if status != SocketStatus::Unbound {
                return Err(invalid_state(format!("bind on {status:?} socket")));
            }
            if inner.network.bindings.contains_key(&local) {
                return Err(SimulationError::AddrInUse(local));
            }
            inner.network.bindings.insert(local, id);
            if let Some(sock) = inner.network.sockets.get_mut(&id) {
                sock.local = Some(local);
                sock.status = SocketStatus::Bound;
            }
            debug!(%id, %local, "socket bound");
            Ok(())
        })
    }

    pub(crate) fn socket_listen(&self, id: SocketId) -> SimulationResult<()> {
        self.with_inner(|inner| {
            let sock = inner
                .network
                .sockets
                .get_mut(&id)
                .ok_or_else(|| unknown_socket(id))?;
            if sock.kind != SocketKind::Stream {
                return Err(invalid_state("listen on datagram socket"));
            }
            if sock.status != SocketStatus::Bound {
                return Err(invalid_state(format!("listen on {:?} socket", sock.status)));
            }
            sock.status = SocketStatus::Listening;
            debug!(%id, "socket listening");
            Ok(())
        })
    }

    pub(crate) fn socket_connect(&self, id: SocketId, peer: Endpoint) -> SimulationResult<()> {
        let stream_delay = self.with_inner(|inner| {
            let sock = inner
                .network
                .sockets
                .get_mut(&id)
                .ok_or_else(|| unknown_socket(id))?;
            match sock.kind {
                SocketKind::Datagram => {
                    if sock.status != SocketStatus::Bound {
                        return Err(invalid_state(format!(
                            "connect on {:?} datagram socket",
                            sock.status
                        )));
                    }
                    // Synchronous local operation: only fixes the default peer.
                    sock.peer = Some(peer);
                    Ok(None)
                }
                SocketKind::Stream => {
                    if sock.status != SocketStatus::Bound {
                        return Err(invalid_state(format!(
                            "connect on {:?} stream socket",
                            sock.status
                        )));
                    }
                    sock.status = SocketStatus::Connecting;
                    sock.peer = Some(peer);
                    Ok(Some(sample_duration(&inner.network.config.connect_latency)))
                }
            }
        })?;

        if let Some(delay) = stream_delay {
            debug!(%id, %peer, ?delay, "connection attempt in flight");
            self.schedule(delay, move |sim| sim.complete_stream_connect(id));
        }
        Ok(())
    }

    /// Resolves an in-flight stream connection attempt.
    ///
    /// Runs as a scheduled event after the sampled connect latency. The
    /// attempt succeeds when a listening stream socket is bound at the peer
    /// endpoint; otherwise the connecting socket transitions to `Closed`
    /// and the failure callback fires exactly once.
    fn complete_stream_connect(&self, client: SocketId) {
        let outcome = self.with_inner(|inner| {
            let (peer, client_local) = match inner.network.sockets.get(&client) {
                Some(sock) if sock.status == SocketStatus::Connecting => {
                    match (sock.peer, sock.local) {
                        (Some(peer), Some(local)) => (peer, local),
                        _ => return ConnectOutcome::Ignore,
                    }
                }
                // Closed or dropped while the attempt was in flight.
                _ => return ConnectOutcome::Ignore,
            };

            let listener = inner.network.bindings.get(&peer).copied().filter(|lid| {
                inner
                    .network
                    .sockets
                    .get(lid)
                    .map(|l| l.kind == SocketKind::Stream && l.status == SocketStatus::Listening)
                    .unwrap_or(false)
            });

            match listener {
                Some(listener) => {
                    let server = SocketId(inner.network.next_socket_id);
                    inner.network.next_socket_id += 1;

                    let mut server_state = SocketState::new(server, SocketKind::Stream);
                    server_state.status = SocketStatus::Connected;
                    server_state.local = Some(peer);
                    server_state.peer = Some(client_local);
                    server_state.paired = Some(client);
                    server_state.next_delivery_time = inner.current_time;
                    inner.network.sockets.insert(server, server_state);

                    let accept_cb = inner
                        .network
                        .sockets
                        .get_mut(&listener)
                        .and_then(|l| l.callbacks.on_accept.take());

                    let succeeded_cb = match inner.network.sockets.get_mut(&client) {
                        Some(sock) => {
                            sock.status = SocketStatus::Connected;
                            sock.paired = Some(server);
                            sock.next_delivery_time = inner.current_time;
                            sock.callbacks.on_connect_succeeded.take()
                        }
                        None => None,
                    };

                    ConnectOutcome::Succeeded {
                        listener,
                        server,
                        client_local,
                        accept_cb,
                        succeeded_cb,
                    }
                }
                None => {
                    let callbacks = match inner.network.sockets.get_mut(&client) {
                        Some(sock) => {
                            sock.status = SocketStatus::Closed;
                            if let Some(local) = sock.local {
                                if inner.network.bindings.get(&local) == Some(&client) {
                                    inner.network.bindings.remove(&local);
                                }
                            }
                            mem::take(&mut sock.callbacks)
                        }
                        None => SocketCallbacks::default(),
                    };
                    ConnectOutcome::Failed { callbacks }
                }
            }
        });

        match outcome {
            ConnectOutcome::Succeeded {
                listener,
                server,
                client_local,
                accept_cb,
                succeeded_cb,
            } => {
                debug!(%client, %server, "connection established");
                // The server side learns of the connection first, then the
                // client's success callback fires, mirroring the handshake.
                if let Some(mut cb) = accept_cb {
                    cb(self.socket_handle(server), client_local);
                    self.restore_callback(listener, cb, |c| &mut c.on_accept);
                }
                if let Some(mut cb) = succeeded_cb {
                    // One-shot: dropped after the invocation.
                    cb(self.socket_handle(client));
                }
            }
            ConnectOutcome::Failed { mut callbacks } => {
                debug!(%client, "connection refused: no listener at peer");
                if let Some(mut cb) = callbacks.on_connect_failed.take() {
                    cb(self.socket_handle(client), SimulationError::ConnectFailed);
                }
                // Remaining callbacks dropped outside the borrow.
                drop(callbacks);
            }
            ConnectOutcome::Ignore => {}
        }
    }

    pub(crate) fn socket_send(&self, id: SocketId, payload: Bytes) -> SimulationResult<usize> {
        let len = payload.len();
        let mode = self.with_inner(|inner| {
            let now = inner.current_time;
            let config = &inner.network.config;
            let sock = inner
                .network
                .sockets
                .get_mut(&id)
                .ok_or_else(|| unknown_socket(id))?;
            match sock.kind {
                SocketKind::Datagram => match sock.status {
                    SocketStatus::Bound => {
                        let dest = sock.peer.ok_or(SimulationError::NotConnected)?;
                        let from = sock.local.ok_or(SimulationError::NotConnected)?;
                        let delay = sample_duration(&config.datagram_latency);
                        Ok(SendMode::Datagram { dest, from, delay })
                    }
                    other => Err(invalid_state(format!("send on {other:?} datagram socket"))),
                },
                SocketKind::Stream => match sock.status {
                    SocketStatus::Connected => {
                        let dst = sock.paired.ok_or(SimulationError::NotConnected)?;
                        let from = sock.local.ok_or(SimulationError::NotConnected)?;
                        // FIFO ordering: a segment never overtakes one queued
                        // earlier on the same connection, whatever latency it
                        // sampled.
                        let delivery = std::cmp::max(
                            now + sample_duration(&config.write_latency),
                            sock.next_delivery_time,
                        );
                        sock.next_delivery_time = delivery + Duration::from_nanos(1);
                        Ok(SendMode::Stream {
                            dst,
                            from,
                            delay: delivery - now,
                        })
                    }
                    SocketStatus::Connecting | SocketStatus::Closed => {
                        Err(SimulationError::NotConnected)
                    }
                    other => Err(invalid_state(format!("send on {other:?} stream socket"))),
                },
            }
        })?;

        match mode {
            SendMode::Datagram { dest, from, delay } => {
                trace!(%id, %dest, len, ?delay, "datagram queued");
                self.schedule(delay, move |sim| {
                    sim.complete_datagram_send(id, dest, from, payload);
                });
            }
            SendMode::Stream { dst, from, delay } => {
                trace!(%id, %dst, len, ?delay, "stream segment queued");
                self.schedule(delay, move |sim| {
                    sim.complete_stream_send(id, dst, from, payload);
                });
            }
        }
        Ok(len)
    }

    pub(crate) fn socket_send_to(
        &self,
        id: SocketId,
        payload: Bytes,
        dest: Endpoint,
    ) -> SimulationResult<usize> {
        let len = payload.len();
        let (from, delay) = self.with_inner(|inner| {
            let sock = inner
                .network
                .sockets
                .get(&id)
                .ok_or_else(|| unknown_socket(id))?;
            if sock.kind != SocketKind::Datagram {
                return Err(invalid_state("send_to on stream socket"));
            }
            if sock.status != SocketStatus::Bound {
                return Err(invalid_state(format!(
                    "send_to on {:?} datagram socket",
                    sock.status
                )));
            }
            let from = sock.local.ok_or(SimulationError::NotConnected)?;
            Ok((from, sample_duration(&inner.network.config.datagram_latency)))
        })?;

        trace!(%id, %dest, len, ?delay, "datagram queued");
        self.schedule(delay, move |sim| {
            sim.complete_datagram_send(id, dest, from, payload);
        });
        Ok(len)
    }

    /// Transmission event for a queued datagram: signals the sender, then
    /// resolves the destination binding at delivery time. A datagram with
    /// no bound receiver is dropped silently.
    fn complete_datagram_send(&self, src: SocketId, dest: Endpoint, from: Endpoint, payload: Bytes) {
        let len = payload.len();
        self.notify_sent(src, len);

        let dst = self.with_inner(|inner| {
            inner.network.bindings.get(&dest).copied().filter(|sid| {
                inner
                    .network
                    .sockets
                    .get(sid)
                    .map(|s| s.kind == SocketKind::Datagram && s.status != SocketStatus::Closed)
                    .unwrap_or(false)
            })
        });
        match dst {
            Some(dst) => self.deliver(dst, payload, from),
            None => trace!(%dest, len, "datagram dropped: no receiver bound"),
        }
    }

    /// Transmission event for a queued stream segment.
    fn complete_stream_send(&self, src: SocketId, dst: SocketId, from: Endpoint, payload: Bytes) {
        self.notify_sent(src, payload.len());
        self.deliver(dst, payload, from);
    }

    /// Places a payload in the destination's ready queue and triggers its
    /// recv callback. Deliveries to a closed socket are dropped: a closed
    /// socket never receives a callback invocation.
    fn deliver(&self, dst: SocketId, payload: Bytes, from: Endpoint) {
        let callback = self.with_inner(|inner| {
            let sock = inner.network.sockets.get_mut(&dst)?;
            if sock.status == SocketStatus::Closed {
                trace!(%dst, "delivery dropped: socket closed");
                return None;
            }
            trace!(%dst, %from, len = payload.len(), "payload delivered");
            sock.recv_queue.push_back((payload, from));
            sock.callbacks.on_recv.take()
        });

        if let Some(mut cb) = callback {
            cb(self.socket_handle(dst));
            self.restore_callback(dst, cb, |c| &mut c.on_recv);
        }
    }

    /// Invokes the sender's sent callback outside the core borrow.
    fn notify_sent(&self, id: SocketId, len: usize) {
        let callback = self.with_inner(|inner| {
            match inner.network.sockets.get_mut(&id) {
                Some(sock) if sock.status != SocketStatus::Closed => sock.callbacks.on_sent.take(),
                _ => None,
            }
        });
        if let Some(mut cb) = callback {
            cb(self.socket_handle(id), len);
            self.restore_callback(id, cb, |c| &mut c.on_sent);
        }
    }

    pub(crate) fn socket_recv_from(
        &self,
        id: SocketId,
    ) -> SimulationResult<Option<(Bytes, Endpoint)>> {
        self.with_inner(|inner| {
            let sock = inner
                .network
                .sockets
                .get_mut(&id)
                .ok_or_else(|| unknown_socket(id))?;
            if sock.status == SocketStatus::Closed {
                return Ok(None);
            }
            Ok(sock.recv_queue.pop_front())
        })
    }

    pub(crate) fn socket_close(&self, id: SocketId) -> SimulationResult<()> {
        let (callbacks, notify_peer) = self.with_inner(|inner| {
            let sock = match inner.network.sockets.get_mut(&id) {
                Some(sock) => sock,
                None => return (None, None),
            };
            if sock.status == SocketStatus::Closed {
                // Double-close is a no-op.
                return (None, None);
            }
            let was_connected = sock.status == SocketStatus::Connected;
            sock.status = SocketStatus::Closed;
            let local = sock.local;
            let paired = sock.paired.take();
            let callbacks = mem::take(&mut sock.callbacks);

            // Accepted sockets share the listener's endpoint; only the
            // binding's owner releases it.
            if let Some(local) = local {
                if inner.network.bindings.get(&local) == Some(&id) {
                    inner.network.bindings.remove(&local);
                }
            }
            debug!(%id, "socket closed");
            (Some(callbacks), if was_connected { paired } else { None })
        });

        if let Some(peer) = notify_peer {
            let delay = self.with_inner(|inner| sample_duration(&inner.network.config.close_latency));
            self.schedule(delay, move |sim| sim.complete_peer_close(peer));
        }
        // Callback set dropped outside the borrow: teardown of captured
        // owners may re-enter the scheduler.
        drop(callbacks);
        Ok(())
    }

    /// Close-notify event on the peer of a closed stream socket.
    fn complete_peer_close(&self, peer: SocketId) {
        let callbacks = self.with_inner(|inner| {
            let sock = inner.network.sockets.get_mut(&peer)?;
            if sock.status == SocketStatus::Closed {
                return None;
            }
            sock.status = SocketStatus::Closed;
            sock.paired = None;
            if let Some(local) = sock.local {
                if inner.network.bindings.get(&local) == Some(&peer) {
                    inner.network.bindings.remove(&local);
                }
            }
            debug!(%peer, "peer closed by remote");
            Some(mem::take(&mut sock.callbacks))
        });

        if let Some(mut callbacks) = callbacks {
            if let Some(mut cb) = callbacks.on_close.take() {
                cb(self.socket_handle(peer));
            }
            drop(callbacks);
        }
    }

    /// Replaces a callback slot, dropping any previous callback outside the
    /// core borrow.
    fn socket_replace_callback<T>(
        &self,
        id: SocketId,
        callback: T,
        slot: impl FnOnce(&mut SocketCallbacks) -> &mut Option<T>,
    ) -> SimulationResult<()> {
        let old = self.with_inner(move |inner| {
            let sock = inner
                .network
                .sockets
                .get_mut(&id)
                .ok_or_else(|| unknown_socket(id))?;
            if sock.status == SocketStatus::Closed {
                return Err(invalid_state("callback registration on closed socket"));
            }
            Ok(mem::replace(slot(&mut sock.callbacks), Some(callback)))
        })?;
        drop(old);
        Ok(())
    }

    /// Puts a taken callback back unless the socket closed or the handler
    /// installed a replacement while it ran.
    fn restore_callback<T>(
        &self,
        id: SocketId,
        callback: T,
        slot: impl FnOnce(&mut SocketCallbacks) -> &mut Option<T>,
    ) {
        let leftover = self.with_inner(move |inner| {
            if let Some(sock) = inner.network.sockets.get_mut(&id) {
                if sock.status != SocketStatus::Closed {
                    let slot = slot(&mut sock.callbacks);
                    if slot.is_none() {
                        *slot = Some(callback);
                        return None;
                    }
                }
            }
            Some(callback)
        });
        drop(leftover);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn config() -> crate::NetworkConfiguration {
        crate::NetworkConfiguration::fast_local()
    }

    #[test]
    fn bind_conflicts_fail_with_addr_in_use() {
        let sim = SimWorld::new_with_network_config(config());
        let addr = Endpoint::v4(10, 0, 0, 1, 9);

        let first = sim.udp_socket();
        first.bind(addr).expect("first bind succeeds");

        let second = sim.udp_socket();
        assert_eq!(second.bind(addr), Err(SimulationError::AddrInUse(addr)));
    }

    #[test]
    fn rebind_fails_with_invalid_state() {
        let sim = SimWorld::new_with_network_config(config());
        let socket = sim.udp_socket();
        socket.bind(Endpoint::v4(10, 0, 0, 1, 9)).expect("bind");

        let err = socket.bind(Endpoint::v4(10, 0, 0, 1, 10));
        assert!(matches!(err, Err(SimulationError::InvalidState(_))));
    }

    #[test]
    fn datagram_send_without_peer_is_not_connected() {
        let sim = SimWorld::new_with_network_config(config());
        let socket = sim.udp_socket();
        socket.bind(Endpoint::v4(10, 0, 0, 1, 9)).expect("bind");

        assert_eq!(
            socket.send(Bytes::from_static(b"hi")),
            Err(SimulationError::NotConnected)
        );
    }

    #[test]
    fn datagram_roundtrip_delivers_payload_and_source() {
        let mut sim = SimWorld::new_with_network_config(config());
        let a_addr = Endpoint::v4(10, 0, 0, 1, 9);
        let b_addr = Endpoint::v4(10, 0, 0, 2, 9);

        let a = sim.udp_socket();
        a.bind(a_addr).expect("bind a");
        a.connect(b_addr).expect("fix default peer");

        let b = sim.udp_socket();
        b.bind(b_addr).expect("bind b");

        a.send(Bytes::from_static(b"ping")).expect("send");
        sim.run_until_empty();

        let (payload, from) = b
            .recv_from()
            .expect("world alive")
            .expect("payload arrived");
        assert_eq!(&payload[..], b"ping");
        assert_eq!(from, a_addr);
        assert_eq!(b.recv_from().expect("world alive"), None);
    }

    #[test]
    fn datagram_to_unbound_endpoint_is_dropped_silently() {
        let mut sim = SimWorld::new_with_network_config(config());
        let a = sim.udp_socket();
        a.bind(Endpoint::v4(10, 0, 0, 1, 9)).expect("bind");

        a.send_to(Bytes::from_static(b"void"), Endpoint::v4(10, 0, 0, 9, 9))
            .expect("send_to queues");
        sim.run_until_empty(); // Must not panic; packet just disappears.
    }

    #[test]
    fn sent_callback_fires_on_transmission() {
        let mut sim = SimWorld::new_with_network_config(config());
        let a = sim.udp_socket();
        a.bind(Endpoint::v4(10, 0, 0, 1, 9)).expect("bind");

        let sent = Rc::new(RefCell::new(0usize));
        let sent_clone = sent.clone();
        a.set_sent_callback(move |_, len| {
            *sent_clone.borrow_mut() += len;
        })
        .expect("register");

        a.send_to(Bytes::from_static(b"abcd"), Endpoint::v4(10, 0, 0, 9, 9))
            .expect("queue");
        assert_eq!(*sent.borrow(), 0); // Completion is asynchronous.
        sim.run_until_empty();
        assert_eq!(*sent.borrow(), 4);
    }

    #[test]
    fn stream_send_before_connect_fails() {
        let sim = SimWorld::new_with_network_config(config());
        let socket = sim.tcp_socket();

        // Unbound stream socket.
        assert!(matches!(
            socket.send(Bytes::from_static(b"x")),
            Err(SimulationError::InvalidState(_))
        ));

        socket.bind(Endpoint::v4(10, 0, 0, 1, 4000)).expect("bind");
        assert!(matches!(
            socket.send(Bytes::from_static(b"x")),
            Err(SimulationError::InvalidState(_))
        ));
    }

    #[test]
    fn close_is_idempotent_and_releases_binding() {
        let sim = SimWorld::new_with_network_config(config());
        let addr = Endpoint::v4(10, 0, 0, 1, 9);

        let socket = sim.udp_socket();
        socket.bind(addr).expect("bind");
        socket.close().expect("close");
        socket.close().expect("double close is a no-op");
        assert_eq!(socket.status().expect("world alive"), SocketStatus::Closed);

        // The endpoint is free again.
        let other = sim.udp_socket();
        other.bind(addr).expect("rebind after close");
    }

    #[test]
    fn closed_socket_never_receives_recv_callback() {
        let mut sim = SimWorld::new_with_network_config(config());
        let a_addr = Endpoint::v4(10, 0, 0, 1, 9);
        let b_addr = Endpoint::v4(10, 0, 0, 2, 9);

        let a = sim.udp_socket();
        a.bind(a_addr).expect("bind a");
        let b = sim.udp_socket();
        b.bind(b_addr).expect("bind b");

        let received = Rc::new(RefCell::new(0u32));
        let received_clone = received.clone();
        b.set_recv_callback(move |_| {
            *received_clone.borrow_mut() += 1;
        })
        .expect("register");

        a.send_to(Bytes::from_static(b"late"), b_addr).expect("queue");
        b.close().expect("close before delivery");

        sim.run_until_empty();
        assert_eq!(*received.borrow(), 0);
    }
}
