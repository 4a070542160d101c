//! Transport-packet-backed streams.
//!
//! A remote stream is the local mirror of a stream living on the other
//! side of a transport. It owns no descriptor and no queue: enqueue
//! becomes a `WRTE` packet, readiness becomes an `OKAY`, shutdown becomes
//! a `CLSE`. The transport runs its own flow control, so enqueue always
//! claims saturation; the peer's reads resume when the other side's OKAY
//! comes back through the demuxer.

use tracing::{debug, trace, warn};

use crate::arena::Handle;
use crate::mux::Mux;
use crate::packet::Packet;
use crate::services::{HostRequestHandler, ServiceBroker};
use crate::socket::Socket;
use crate::transport::SharedTransport;
use crate::types::{EnqueueResult, StreamId};
use crate::wire::{Command, ControlPacket};

impl<B: ServiceBroker, H: HostRequestHandler> Mux<B, H> {
    /// Create a remote stream mirroring stream `id` on the other side.
    ///
    /// `id` is allocated by the remote side and can never be zero.
    pub(crate) fn create_remote_socket(
        &mut self,
        id: StreamId,
        transport: SharedTransport,
    ) -> Handle {
        if id.is_unassigned() {
            crate::fatal("invalid remote stream id (0)");
        }
        let h = self.sockets.insert(Socket::remote(id, transport));
        debug!(id = id.raw(), "RS created");
        h
    }

    /// Forward a packet to the other side as `WRTE`.
    pub(crate) fn remote_enqueue(&mut self, h: Handle, p: Packet) -> EnqueueResult {
        let Some(sock) = self.sockets.get(h) else {
            return EnqueueResult::Closed;
        };
        let id = sock.id;
        let peer_id = sock
            .peer
            .and_then(|ph| self.sockets.get(ph))
            .map(|s| s.id)
            .unwrap_or(StreamId::UNASSIGNED);
        let Some(transport) = sock.transport.clone() else {
            warn!(id = id.raw(), "RS enqueue without a transport, dropping");
            return EnqueueResult::NotReady;
        };
        let payload = p.into_payload();
        trace!(id = id.raw(), len = payload.len(), "RS WRTE");
        transport.send(ControlPacket {
            command: Command::Write,
            arg0: peer_id.raw(),
            arg1: id.raw(),
            payload,
        });
        EnqueueResult::NotReady
    }

    /// Grant the other side fresh readiness with `OKAY`.
    pub(crate) fn remote_ready(&mut self, h: Handle) {
        let Some(sock) = self.sockets.get(h) else {
            return;
        };
        let id = sock.id;
        let peer_id = sock
            .peer
            .and_then(|ph| self.sockets.get(ph))
            .map(|s| s.id)
            .unwrap_or(StreamId::UNASSIGNED);
        let Some(transport) = sock.transport.clone() else {
            warn!(id = id.raw(), "RS ready without a transport, dropping");
            return;
        };
        trace!(id = id.raw(), "RS OKAY");
        transport.send(ControlPacket::control(Command::Okay, peer_id, id));
    }

    /// Tell the other side we are going away with `CLSE`.
    ///
    /// Runs while the peer link is still intact so the packet carries the
    /// peer's id; once detached, a zero stands in.
    pub(crate) fn remote_shutdown(&mut self, h: Handle) {
        let Some(sock) = self.sockets.get(h) else {
            return;
        };
        let id = sock.id;
        let peer_id = sock
            .peer
            .and_then(|ph| self.sockets.get(ph))
            .map(|s| s.id)
            .unwrap_or(StreamId::UNASSIGNED);
        let Some(transport) = sock.transport.clone() else {
            warn!(id = id.raw(), "RS shutdown without a transport, dropping");
            return;
        };
        debug!(id = id.raw(), peer = peer_id.raw(), "RS CLSE");
        transport.send(ControlPacket::control(Command::Close, peer_id, id));
    }

    /// Local teardown only; the wire close is `shutdown`'s job.
    pub(crate) fn remote_close(&mut self, h: Handle) {
        let Some(sock) = self.sockets.get(h) else {
            return;
        };
        let id = sock.id;
        let peer = sock.peer;
        if let Some(ph) = peer {
            if let Some(p) = self.sockets.get_mut(ph) {
                p.peer = None;
            }
            self.close(ph);
        }
        self.sockets.remove(h);
        debug!(id = id.raw(), "RS closed");
    }

    /// Ask the other side to open `destination` for the local stream `h`.
    pub fn connect_to_remote(&mut self, h: Handle, destination: &str) {
        let Some(sock) = self.sockets.get(h) else {
            return;
        };
        let id = sock.id;
        let Some(transport) = sock.transport.clone() else {
            crate::fatal("connect_to_remote on a stream with no transport");
        };
        // NUL-terminated on the wire.
        let len = destination.len() + 1;
        if len > transport.max_payload() - 1 {
            crate::fatal("destination oversized");
        }
        debug!(id = id.raw(), destination, "LS connect");
        let mut payload = Vec::with_capacity(len);
        payload.extend_from_slice(destination.as_bytes());
        payload.push(0);
        transport.send(ControlPacket {
            command: Command::Open,
            arg0: id.raw(),
            arg1: 0,
            payload,
        });
    }
}
