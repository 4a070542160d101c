//! File-descriptor-backed streams.
//!
//! A local stream forwards bytes read from its endpoint to its peer as
//! packets, and drains packets its peer enqueued back onto the endpoint.
//! Backpressure is receiver-driven: reads stay enabled only while the peer
//! keeps returning `Ready`, write interest is a pure function of the
//! backlog, and a drained backlog grants the peer fresh readiness.
//!
//! Closing is the delicate part. A stream with unwritten backlog is not
//! destroyed; it detaches from its peer, leaves the live table, and keeps
//! draining on the closing list until the last byte (or a write error)
//! lets it go.

use std::collections::VecDeque;
use std::io;

use tracing::{debug, trace};

use crate::arena::Handle;
use crate::endpoint::Endpoint;
use crate::mux::Mux;
use crate::packet::Packet;
use crate::reactor::{Events, Registrar};
use crate::services::{HostRequestHandler, ServiceBroker};
use crate::socket::SocketKind;
use crate::types::EnqueueResult;

/// One-shot status reporting for freshly tunneled client connections.
///
/// While a tunnel request is in flight the client has seen no status line
/// yet. The first readiness grant (the remote answered OKAY) or the first
/// close (the remote answered CLSE, or the transport died) must emit the
/// human-readable verdict exactly once, then behave normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusMode {
    Normal,
    NotifyOnFirst,
}

/// State owned by a local stream beyond the common spine.
pub(crate) struct LocalSocket {
    pub(crate) endpoint: Box<dyn Endpoint>,
    /// Mirror of the interest currently published to the registrar.
    pub(crate) interest: Events,
    /// Packets awaiting their turn on the endpoint, oldest first.
    pub(crate) backlog: VecDeque<Packet>,
    /// Set once the stream moves to the closing list.
    pub(crate) closing: bool,
    /// A write failed hard; the next close destroys immediately.
    pub(crate) has_write_error: bool,
    /// Destroying this stream terminates the process.
    pub(crate) exit_on_close: bool,
    /// Treat the endpoint as EOF at the next quiescent read.
    pub(crate) force_eof: bool,
    pub(crate) status: StatusMode,
}

impl LocalSocket {
    pub(crate) fn new(endpoint: Box<dyn Endpoint>) -> Self {
        Self {
            endpoint,
            interest: Events::empty(),
            backlog: VecDeque::new(),
            closing: false,
            has_write_error: false,
            exit_on_close: false,
            force_eof: false,
            status: StatusMode::Normal,
        }
    }
}

pub(crate) fn add_interest(registrar: &dyn Registrar, local: &mut LocalSocket, bits: Events) {
    if !local.interest.contains(bits) {
        local.interest |= bits;
        registrar.update(local.endpoint.raw_fd(), local.interest);
    }
}

pub(crate) fn del_interest(registrar: &dyn Registrar, local: &mut LocalSocket, bits: Events) {
    if local.interest.intersects(bits) {
        local.interest -= bits;
        registrar.update(local.endpoint.raw_fd(), local.interest);
    }
}

impl<B: ServiceBroker, H: HostRequestHandler> Mux<B, H> {
    /// Push a packet toward the endpoint, writing opportunistically and
    /// falling back to the backlog on `WouldBlock`.
    pub(crate) fn local_enqueue(&mut self, h: Handle, mut p: Packet) -> EnqueueResult {
        let Some(sock) = self.sockets.get_mut(h) else {
            return EnqueueResult::Closed;
        };
        let id = sock.id;
        let SocketKind::Local(local) = &mut sock.kind else {
            debug_assert!(false, "local_enqueue on a non-local stream");
            return EnqueueResult::Closed;
        };
        trace!(id = id.raw(), len = p.len(), "LS enqueue");

        if local.backlog.is_empty() {
            // Write as much as we can before paying for a readiness cycle.
            let mut hard_error = false;
            while !p.is_drained() {
                match local.endpoint.write(p.unread()) {
                    Ok(n) if n > 0 => p.advance(n),
                    Ok(_) => {
                        hard_error = true;
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        trace!(id = id.raw(), error = %e, "LS write failed in enqueue");
                        hard_error = true;
                        break;
                    }
                }
            }
            if hard_error {
                local.has_write_error = true;
                self.local_close(h);
                return EnqueueResult::NotReady;
            }
            if p.is_drained() {
                return EnqueueResult::Ready;
            }
        }

        local.backlog.push_back(p);
        add_interest(self.registrar.as_ref(), local, Events::WRITE);
        EnqueueResult::NotReady
    }

    /// The far side can take more data: resume reading the endpoint.
    ///
    /// If a tunnel verdict is still owed, the grant doubles as the OKAY
    /// status line the client has been waiting for.
    pub(crate) fn local_ready(&mut self, h: Handle) {
        let notify = match self.sockets.get_mut(h) {
            Some(sock) => match &mut sock.kind {
                SocketKind::Local(local) if local.status == StatusMode::NotifyOnFirst => {
                    local.status = StatusMode::Normal;
                    true
                }
                SocketKind::Local(_) => false,
                _ => return,
            },
            None => return,
        };
        if notify {
            self.send_status_line(h, crate::wire::OKAY_LINE);
            if !self.sockets.contains(h) {
                return;
            }
        }
        if let Some(sock) = self.sockets.get_mut(h) {
            if let SocketKind::Local(local) = &mut sock.kind {
                add_interest(self.registrar.as_ref(), local, Events::READ);
            }
        }
    }

    /// Close this stream, cascading to the peer.
    ///
    /// The peer's `shutdown` runs before the link is broken so its close
    /// packet still carries our id. A stream with pending backlog moves to
    /// the closing list instead of dying; everything else is destroyed on
    /// the spot.
    pub(crate) fn local_close(&mut self, h: Handle) {
        let Some(sock) = self.sockets.get(h) else {
            return;
        };
        let id = sock.id;
        debug!(id = id.raw(), "LS close");

        let notify = match self.sockets.get_mut(h) {
            Some(sock) => match &mut sock.kind {
                SocketKind::Local(local) if local.status == StatusMode::NotifyOnFirst => {
                    local.status = StatusMode::Normal;
                    true
                }
                _ => false,
            },
            None => return,
        };
        if notify {
            let line = crate::wire::fail_line("closed");
            self.send_status_line(h, &line);
            if !self.sockets.contains(h) {
                return;
            }
        }

        let peer = self.sockets.get(h).and_then(|s| s.peer);
        if let Some(ph) = peer {
            self.shutdown(ph);
            if let Some(p) = self.sockets.get_mut(ph) {
                p.peer = None;
            }
            if let Some(s) = self.sockets.get_mut(h) {
                s.peer = None;
            }
            self.close(ph);
            if !self.sockets.contains(h) {
                return;
            }
        }

        let Some(sock) = self.sockets.get_mut(h) else {
            return;
        };
        let SocketKind::Local(local) = &mut sock.kind else {
            return;
        };
        if local.closing || local.has_write_error || local.backlog.is_empty() {
            self.local_destroy(h);
            debug!(id = id.raw(), "LS closed");
            return;
        }

        // Drain first, die later.
        debug!(id = id.raw(), "LS closing, backlog pending");
        local.closing = true;
        del_interest(self.registrar.as_ref(), local, Events::READ);
        debug_assert!(
            local.interest.contains(Events::WRITE),
            "a closing stream must stay write-armed or its backlog never drains"
        );
        self.registry.remove_live(id);
        self.registry.push_closing(h);
    }

    /// Tear the stream down for real. Deregistration precedes the fd
    /// close, and the fd close precedes releasing the backlog.
    pub(crate) fn local_destroy(&mut self, h: Handle) {
        let Some(sock) = self.sockets.remove(h) else {
            return;
        };
        let SocketKind::Local(local) = sock.kind else {
            return;
        };
        let fd = local.endpoint.raw_fd();
        debug!(id = sock.id.raw(), fd, "LS destroy");
        self.registrar.remove(fd);
        self.by_fd.remove(&fd);
        self.registry.remove_live(sock.id);
        self.registry.remove_closing(h);
        let exit = local.exit_on_close;
        drop(local);
        if exit {
            debug!("exit_on_close stream destroyed, terminating process");
            (self.exit_hook)();
        }
    }

    /// Readiness delivery. Writes are handled before reads; a stream that
    /// just drained its backlog is in a known-good state for the read path.
    pub(crate) fn local_events(&mut self, h: Handle, events: Events) {
        if events.contains(Events::WRITE) && !self.local_writable(h) {
            return;
        }
        if events.contains(Events::READ) {
            self.local_readable(h);
            if !self.sockets.contains(h) {
                return;
            }
        }
        if events.contains(Events::ERROR) {
            // Left to the next read or write, which observes the failure
            // without skipping any final readable bytes.
            trace!("LS error event deferred to the next I/O");
        }
    }

    /// Drain the backlog. Returns false when event processing for this
    /// stream must stop (blocked, closed, or destroyed).
    fn local_writable(&mut self, h: Handle) -> bool {
        loop {
            let Some(sock) = self.sockets.get_mut(h) else {
                return false;
            };
            let id = sock.id;
            let SocketKind::Local(local) = &mut sock.kind else {
                return false;
            };
            let Some(front) = local.backlog.front_mut() else {
                break;
            };

            let mut hard_error = false;
            while !front.is_drained() {
                match local.endpoint.write(front.unread()) {
                    Ok(n) if n > 0 => front.advance(n),
                    Ok(_) => {
                        hard_error = true;
                        break;
                    }
                    // Blocked again; the loop re-arms us.
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                    Err(e) => {
                        trace!(id = id.raw(), error = %e, "LS write failed in drain");
                        hard_error = true;
                        break;
                    }
                }
            }
            if hard_error {
                local.has_write_error = true;
                self.local_close(h);
                return false;
            }
            local.backlog.pop_front();
        }

        let Some(sock) = self.sockets.get_mut(h) else {
            return false;
        };
        let SocketKind::Local(local) = &mut sock.kind else {
            return false;
        };
        if local.closing {
            // Last pending byte just left; finish the close.
            self.local_close(h);
            return false;
        }
        del_interest(self.registrar.as_ref(), local, Events::WRITE);
        let peer = sock.peer;
        if let Some(ph) = peer {
            self.ready(ph);
        }
        true
    }

    /// Read a burst from the endpoint and forward it to the peer.
    fn local_readable(&mut self, h: Handle) {
        let cap = self.effective_max_payload(h);

        let (data, filled, is_eof, force_eof, peer, id) = {
            let Some(sock) = self.sockets.get_mut(h) else {
                return;
            };
            let id = sock.id;
            let peer = sock.peer;
            let SocketKind::Local(local) = &mut sock.kind else {
                return;
            };
            let mut data = vec![0u8; cap];
            let mut filled = 0usize;
            let mut is_eof = false;
            while filled < cap {
                match local.endpoint.read(&mut data[filled..]) {
                    Ok(0) => {
                        is_eof = true;
                        break;
                    }
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        trace!(id = id.raw(), error = %e, "LS read failed");
                        is_eof = true;
                        break;
                    }
                }
            }
            (data, filled, is_eof, local.force_eof, peer, id)
        };
        trace!(id = id.raw(), filled, is_eof, "LS read burst");

        // Default matches "nothing was enqueued".
        let mut r = EnqueueResult::Ready;
        if filled > 0 {
            if let Some(ph) = peer {
                let mut data = data;
                data.truncate(filled);
                // The peer may destroy us while consuming this packet; the
                // handle check below is the only safe liveness probe.
                r = self.enqueue(ph, Packet::from_vec(data));
                if !self.sockets.contains(h) {
                    return;
                }
                if r == EnqueueResult::NotReady {
                    // Peer saturated; its ready() re-enables us.
                    if let Some(sock) = self.sockets.get_mut(h) {
                        if let SocketKind::Local(local) = &mut sock.kind {
                            del_interest(self.registrar.as_ref(), local, Events::READ);
                        }
                    }
                }
            }
        }

        // A forced EOF is honored only once the peer has accepted
        // everything; real EOF closes unconditionally.
        if (force_eof && r == EnqueueResult::Ready) || is_eof {
            debug!(id = id.raw(), is_eof, force_eof, "LS closing after read");
            self.local_close(h);
        }
    }
}
