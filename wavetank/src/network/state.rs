//! Socket bookkeeping owned by the simulation world.
//!
//! All socket state lives centrally in [`NetworkState`] inside the world's
//! single `RefCell`; the public [`crate::Socket`] type is only a handle.
//! Callbacks are stored here by value and are taken out of their slot
//! before invocation so no user code ever runs while the core borrow is
//! held.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::error::SimulationError;
use crate::network::config::NetworkConfiguration;
use crate::network::{Endpoint, SocketId, SocketKind, SocketStatus};
use crate::Socket;

pub(crate) type RecvCallback = Box<dyn FnMut(Socket)>;
pub(crate) type AcceptCallback = Box<dyn FnMut(Socket, Endpoint)>;
pub(crate) type ConnectCallback = Box<dyn FnMut(Socket)>;
pub(crate) type ConnectFailedCallback = Box<dyn FnMut(Socket, SimulationError)>;
pub(crate) type SentCallback = Box<dyn FnMut(Socket, usize)>;
pub(crate) type CloseCallback = Box<dyn FnMut(Socket)>;

/// Completion callbacks registered on a socket.
///
/// Non-owning references back into the owning application: every callback
/// captures weak handles only. `close()` replaces the whole set with an
/// empty one, which is what guarantees a closed socket never receives a
/// callback invocation.
#[derive(Default)]
pub(crate) struct SocketCallbacks {
    pub(crate) on_accept: Option<AcceptCallback>,
    pub(crate) on_connect_succeeded: Option<ConnectCallback>,
    pub(crate) on_connect_failed: Option<ConnectFailedCallback>,
    pub(crate) on_recv: Option<RecvCallback>,
    pub(crate) on_sent: Option<SentCallback>,
    pub(crate) on_close: Option<CloseCallback>,
}

impl fmt::Debug for SocketCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketCallbacks")
            .field("on_accept", &self.on_accept.is_some())
            .field("on_connect_succeeded", &self.on_connect_succeeded.is_some())
            .field("on_connect_failed", &self.on_connect_failed.is_some())
            .field("on_recv", &self.on_recv.is_some())
            .field("on_sent", &self.on_sent.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// Central record for one socket.
#[derive(Debug)]
pub(crate) struct SocketState {
    pub(crate) id: SocketId,
    pub(crate) kind: SocketKind,
    pub(crate) status: SocketStatus,
    pub(crate) local: Option<Endpoint>,
    pub(crate) peer: Option<Endpoint>,
    /// The other end of an established stream connection.
    pub(crate) paired: Option<SocketId>,
    /// Already-arrived payloads waiting for `recv_from`.
    pub(crate) recv_queue: VecDeque<(Bytes, Endpoint)>,
    /// FIFO ordering cursor: no stream segment on this connection may be
    /// delivered at or before this time, regardless of sampled latency.
    pub(crate) next_delivery_time: Duration,
    pub(crate) callbacks: SocketCallbacks,
}

impl SocketState {
    pub(crate) fn new(id: SocketId, kind: SocketKind) -> Self {
        Self {
            id,
            kind,
            status: SocketStatus::Unbound,
            local: None,
            peer: None,
            paired: None,
            recv_queue: VecDeque::new(),
            next_delivery_time: Duration::ZERO,
            callbacks: SocketCallbacks::default(),
        }
    }
}

/// All network state of one simulation world.
#[derive(Debug)]
pub(crate) struct NetworkState {
    pub(crate) config: NetworkConfiguration,
    pub(crate) sockets: HashMap<SocketId, SocketState>,
    pub(crate) bindings: HashMap<Endpoint, SocketId>,
    pub(crate) next_socket_id: u64,
}

impl NetworkState {
    pub(crate) fn new(config: NetworkConfiguration) -> Self {
        Self {
            config,
            sockets: HashMap::new(),
            bindings: HashMap::new(),
            next_socket_id: 0,
        }
    }
}
