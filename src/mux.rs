//! The multiplexer: owner of every stream and entry point for both sides.
//!
//! One `Mux` instance lives on the event-loop thread and owns the arena of
//! streams, the registry, and the interest registrar. Every operation -
//! readiness delivery, inbound packet routing, close cascades - runs as a
//! `&mut self` method, so the single-owner borrow replaces the lock a
//! pointer-graph design would need. A demuxer running elsewhere must hand
//! its packets to this thread before calling in.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::arena::{Arena, Handle};
use crate::endpoint::Endpoint;
use crate::error::ServiceError;
use crate::local::LocalSocket;
use crate::packet::Packet;
use crate::reactor::{Events, Registrar};
use crate::registry::Registry;
use crate::services::{HostRequestHandler, ServiceBroker};
use crate::socket::{Socket, SocketKind};
use crate::transport::{same_transport, SharedTransport};
use crate::types::{EnqueueResult, Side, StreamId};
use crate::wire::{Command, ControlPacket};
use crate::MAX_PAYLOAD;

/// Device services whose death is meant to take the daemon with them,
/// forcing clients to reconnect against the restarted process.
const EXIT_ON_CLOSE_SERVICES: [&str; 4] = ["root:", "unroot:", "usb:", "tcpip:"];

/// The socket multiplexing core.
///
/// Generic over the service broker `B` and the host request handler `H`,
/// the two collaborators requests are dispatched to.
pub struct Mux<B, H> {
    pub(crate) side: Side,
    pub(crate) sockets: Arena<Socket>,
    pub(crate) registry: Registry,
    pub(crate) registrar: Arc<dyn Registrar>,
    pub(crate) by_fd: HashMap<RawFd, Handle>,
    pub(crate) broker: B,
    pub(crate) host_requests: H,
    pub(crate) exit_hook: Box<dyn FnMut()>,
}

impl<B: ServiceBroker, H: HostRequestHandler> Mux<B, H> {
    /// Create a mux for one side of the bridge.
    pub fn new(side: Side, registrar: Arc<dyn Registrar>, broker: B, host_requests: H) -> Self {
        Self {
            side,
            sockets: Arena::new(),
            registry: Registry::new(),
            registrar,
            by_fd: HashMap::new(),
            broker,
            host_requests,
            exit_hook: Box::new(|| std::process::exit(1)),
        }
    }

    /// Replace the process-exit sink used by `exit_on_close` streams.
    pub fn set_exit_hook(&mut self, hook: impl FnMut() + 'static) {
        self.exit_hook = Box::new(hook);
    }

    // ========================================================================
    // Stream creation
    // ========================================================================

    /// Wrap an endpoint in a new local stream: assign an id, link it into
    /// the live table, and register its descriptor (with no interest yet).
    pub fn create_local_socket(&mut self, endpoint: Box<dyn Endpoint>) -> Handle {
        let id = self.registry.allocate_id();
        let fd = endpoint.raw_fd();
        let h = self.sockets.insert(Socket::local(id, LocalSocket::new(endpoint)));
        self.registry.install(id, h);
        self.registrar.update(fd, Events::empty());
        self.by_fd.insert(fd, h);
        debug!(id = id.raw(), fd, "LS created");
        h
    }

    /// Open a named device service and wrap it in a local stream.
    ///
    /// A handful of administrative services terminate the daemon when they
    /// finish; their streams get `exit_on_close`.
    pub fn create_local_service_socket(
        &mut self,
        name: &str,
        transport: Option<&SharedTransport>,
    ) -> Result<Handle, ServiceError> {
        let endpoint = self.broker.open_device_service(name, transport)?;
        let h = self.create_local_socket(endpoint);
        debug!(name, "LS bound to service");
        if EXIT_ON_CLOSE_SERVICES.iter().any(|p| name.starts_with(p)) {
            if let Some(sock) = self.sockets.get_mut(h) {
                if let SocketKind::Local(local) = &mut sock.kind {
                    debug!(name, "enabling exit_on_close");
                    local.exit_on_close = true;
                }
            }
        }
        Ok(h)
    }

    /// Pair two streams symmetrically.
    ///
    /// For wiring in-process services: both ends already live in this mux
    /// and neither goes over a transport.
    pub fn pair_streams(&mut self, a: Handle, b: Handle) {
        if let Some(s) = self.sockets.get_mut(a) {
            s.peer = Some(b);
        }
        if let Some(s) = self.sockets.get_mut(b) {
            s.peer = Some(a);
        }
    }

    // ========================================================================
    // The four stream operations, dispatched by variant
    // ========================================================================

    /// Push a packet into a stream. See [`EnqueueResult`] for the flow
    /// control contract; `Closed` means the *caller* was destroyed.
    pub fn enqueue(&mut self, h: Handle, p: Packet) -> EnqueueResult {
        let Some(sock) = self.sockets.get(h) else {
            return EnqueueResult::Closed;
        };
        match sock.kind {
            SocketKind::Local(_) => self.local_enqueue(h, p),
            SocketKind::Remote => self.remote_enqueue(h, p),
            SocketKind::Smart(_) => self.smart_enqueue(h, p),
        }
    }

    /// Grant a stream fresh readiness.
    pub fn ready(&mut self, h: Handle) {
        let Some(sock) = self.sockets.get(h) else {
            return;
        };
        match sock.kind {
            SocketKind::Local(_) => self.local_ready(h),
            SocketKind::Remote => self.remote_ready(h),
            SocketKind::Smart(_) => trace!("SS ready"),
        }
    }

    /// Announce an impending close to the other side, where the variant
    /// has a way to say it.
    pub fn shutdown(&mut self, h: Handle) {
        let Some(sock) = self.sockets.get(h) else {
            return;
        };
        match sock.kind {
            SocketKind::Remote => self.remote_shutdown(h),
            SocketKind::Local(_) | SocketKind::Smart(_) => {}
        }
    }

    /// Close a stream, cascading to its peer.
    pub fn close(&mut self, h: Handle) {
        let Some(sock) = self.sockets.get(h) else {
            return;
        };
        match sock.kind {
            SocketKind::Local(_) => self.local_close(h),
            SocketKind::Remote => self.remote_close(h),
            SocketKind::Smart(_) => self.smart_close(h),
        }
    }

    // ========================================================================
    // Inbound packet routing (called by the transport demuxer)
    // ========================================================================

    /// Look up a live local stream by id, optionally checking which peer
    /// it is paired with. `peer_id` zero skips the pairing check.
    pub fn find_local_socket(&self, local_id: StreamId, peer_id: StreamId) -> Option<Handle> {
        let h = self.registry.find(local_id)?;
        let sock = self.sockets.get(h)?;
        if peer_id.is_unassigned() {
            return Some(h);
        }
        let ph = sock.peer?;
        let peer = self.sockets.get(ph)?;
        (peer.id == peer_id).then_some(h)
    }

    /// The other side wants `service` opened. On success a local/remote
    /// pair starts up and the far side gets an OKAY; on failure it gets a
    /// CLSE naming its stream.
    pub fn handle_open(&mut self, transport: &SharedTransport, their_id: StreamId, service: &str) {
        debug!(their_id = their_id.raw(), service, "OPEN from peer");
        match self.create_local_service_socket(service, Some(transport)) {
            Ok(lh) => {
                let rh = self.create_remote_socket(their_id, transport.clone());
                if let Some(l) = self.sockets.get_mut(lh) {
                    l.peer = Some(rh);
                }
                if let Some(r) = self.sockets.get_mut(rh) {
                    r.peer = Some(lh);
                }
                self.remote_ready(rh);
                self.ready(lh);
            }
            Err(e) => {
                debug!(service, error = %e, "service open failed");
                transport.send(ControlPacket::control(
                    Command::Close,
                    StreamId::UNASSIGNED,
                    their_id,
                ));
            }
        }
    }

    /// An OKAY from the other side: either the completion of an OPEN we
    /// sent (pair up with the now-known remote id) or a flow-control
    /// grant. Both end in `ready()` on the local stream.
    pub fn handle_okay(&mut self, transport: &SharedTransport, their_id: StreamId, my_id: StreamId) {
        let Some(h) = self.find_local_socket(my_id, StreamId::UNASSIGNED) else {
            trace!(my_id = my_id.raw(), "OKAY for unknown stream");
            return;
        };
        let has_peer = self.sockets.get(h).is_some_and(|s| s.peer.is_some());
        if !has_peer {
            debug!(
                my_id = my_id.raw(),
                their_id = their_id.raw(),
                "OKAY completes our OPEN"
            );
            let rh = self.create_remote_socket(their_id, transport.clone());
            if let Some(s) = self.sockets.get_mut(h) {
                s.peer = Some(rh);
            }
            if let Some(r) = self.sockets.get_mut(rh) {
                r.peer = Some(h);
            }
        }
        self.ready(h);
    }

    /// Payload bytes for one of our local streams. A fully accepted packet
    /// earns the sender an immediate OKAY; a saturated stream grants it
    /// later, when the backlog drains.
    pub fn handle_write(&mut self, their_id: StreamId, my_id: StreamId, payload: &[u8]) {
        let Some(h) = self.find_local_socket(my_id, their_id) else {
            trace!(my_id = my_id.raw(), "WRTE for unknown stream");
            return;
        };
        let peer = self.sockets.get(h).and_then(|s| s.peer);
        let r = self.enqueue(h, Packet::from_slice(payload));
        if r == EnqueueResult::Ready {
            if let Some(ph) = peer {
                if self.sockets.contains(ph) {
                    self.remote_ready(ph);
                }
            }
        }
    }

    /// The other side closed its end.
    pub fn handle_close(&mut self, their_id: StreamId, my_id: StreamId) {
        if let Some(h) = self.find_local_socket(my_id, their_id) {
            debug!(my_id = my_id.raw(), "CLSE from peer");
            self.close(h);
        }
    }

    /// Tear down every stream pair riding `transport`. Runs when the link
    /// itself dies.
    pub fn close_all_for(&mut self, transport: &SharedTransport) {
        // Closing cascades and edits the table, so work from a snapshot;
        // stale handles are skipped harmlessly.
        let snapshot = self.registry.live_handles();
        debug!(candidates = snapshot.len(), "closing all streams on transport");
        for h in snapshot {
            if self.sockets.contains(h) && self.uses_transport(h, transport) {
                self.close(h);
            }
        }
    }

    // ========================================================================
    // Event-loop entry
    // ========================================================================

    /// Deliver readiness events for a registered descriptor.
    pub fn dispatch_fd(&mut self, fd: RawFd, events: Events) {
        if let Some(h) = self.by_fd.get(&fd).copied() {
            self.local_events(h, events);
        }
    }

    /// Pretend the stream's endpoint hits EOF at the next quiescent read.
    pub fn set_force_eof(&mut self, h: Handle) {
        if let Some(sock) = self.sockets.get_mut(h) {
            if let SocketKind::Local(local) = &mut sock.kind {
                local.force_eof = true;
            }
        }
    }

    // ========================================================================
    // Introspection (primarily for tests and diagnostics)
    // ========================================================================

    /// True while the handle resolves to a live stream.
    pub fn is_live(&self, h: Handle) -> bool {
        self.sockets.contains(h)
    }

    /// The stream's id, if it is still alive.
    pub fn stream_id(&self, h: Handle) -> Option<StreamId> {
        self.sockets.get(h).map(|s| s.id)
    }

    /// The stream's current peer, if any.
    pub fn peer_of(&self, h: Handle) -> Option<Handle> {
        self.sockets.get(h).and_then(|s| s.peer)
    }

    /// Interest mask currently published for a local stream.
    pub fn interest_of(&self, h: Handle) -> Option<Events> {
        match &self.sockets.get(h)?.kind {
            SocketKind::Local(local) => Some(local.interest),
            _ => None,
        }
    }

    /// Number of packets waiting on a local stream's backlog.
    pub fn backlog_len(&self, h: Handle) -> usize {
        match self.sockets.get(h).map(|s| &s.kind) {
            Some(SocketKind::Local(local)) => local.backlog.len(),
            _ => 0,
        }
    }

    /// Total backlog bytes still to write on a local stream.
    pub fn backlog_bytes(&self, h: Handle) -> usize {
        match self.sockets.get(h).map(|s| &s.kind) {
            Some(SocketKind::Local(local)) => {
                local.backlog.iter().map(|p| p.unread().len()).sum()
            }
            _ => 0,
        }
    }

    /// True once the stream has moved to the closing list.
    pub fn is_closing(&self, h: Handle) -> bool {
        matches!(
            self.sockets.get(h).map(|s| &s.kind),
            Some(SocketKind::Local(local)) if local.closing
        )
    }

    /// Number of installed (live, not closing) local streams.
    pub fn live_count(&self) -> usize {
        self.registry.live_count()
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    /// Payload ceiling for packets produced by stream `h`: the smallest of
    /// the global cap and the caps of both transports involved.
    pub(crate) fn effective_max_payload(&self, h: Handle) -> usize {
        let mut max = MAX_PAYLOAD;
        if let Some(sock) = self.sockets.get(h) {
            if let Some(t) = &sock.transport {
                max = max.min(t.max_payload());
            }
            if let Some(peer) = sock.peer.and_then(|ph| self.sockets.get(ph)) {
                if let Some(t) = &peer.transport {
                    max = max.min(t.max_payload());
                }
            }
        }
        max
    }

    /// True if the stream or its peer rides `transport`.
    fn uses_transport(&self, h: Handle, transport: &SharedTransport) -> bool {
        let Some(sock) = self.sockets.get(h) else {
            return false;
        };
        if sock.transport.as_ref().is_some_and(|t| same_transport(t, transport)) {
            return true;
        }
        sock.peer
            .and_then(|ph| self.sockets.get(ph))
            .and_then(|p| p.transport.as_ref())
            .is_some_and(|t| same_transport(t, transport))
    }

    /// Write a protocol status line (`OKAY`/`FAIL...`) to a local stream's
    /// endpoint, queueing any unwritten tail behind the backlog.
    pub(crate) fn send_status_line(&mut self, h: Handle, line: &[u8]) {
        let _ = self.local_enqueue(h, Packet::from_slice(line));
    }
}

impl<B, H> std::fmt::Debug for Mux<B, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("side", &self.side)
            .field("streams", &self.sockets.len())
            .field("live", &self.registry.live_count())
            .finish()
    }
}
