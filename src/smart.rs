//! Request-parsing streams.
//!
//! Every freshly accepted client connection is paired with a smart socket.
//! The smart socket accumulates bytes until one framed request is complete
//! (four ASCII hex digits of length, then the payload), then decides what
//! the connection *becomes*: an administrative request answered in place,
//! a host-side service stream, or a tunnel to the device - in which case
//! the client's local stream is detached, rigged to report the tunnel
//! verdict, and handed to the transport. Either way the smart socket's job
//! is done and it removes itself.

use tracing::{debug, trace};

use crate::arena::Handle;
use crate::local::StatusMode;
use crate::mux::Mux;
use crate::packet::Packet;
use crate::services::{HostRequest, HostRequestHandler, ServiceBroker};
use crate::socket::{Socket, SocketKind};
use crate::types::{ConnectionState, EnqueueResult, Side, TransportKind};
use crate::wire::{decode_hex_length, fail_line, OKAY_LINE};
use crate::MAX_PAYLOAD_V1;

/// Assembly state of a smart socket.
pub(crate) struct SmartSocket {
    /// Accumulates request bytes until a full frame is present.
    pub(crate) buf: Packet,
}

impl SmartSocket {
    pub(crate) fn new() -> Self {
        Self {
            buf: Packet::with_capacity(MAX_PAYLOAD_V1 + 4),
        }
    }
}

/// A request with a recognized host prefix, ready for dispatch.
struct HostParsed<'a> {
    service: &'a str,
    kind: TransportKind,
    serial: Option<&'a str>,
}

/// Split off the `host...:` prefix of a request, if it has one.
fn parse_host_prefix(request: &str) -> Option<HostParsed<'_>> {
    if let Some(rest) = request.strip_prefix("host-serial:") {
        // The serial itself may contain colons (tcp:host:port forms), so
        // finding the command separator takes its own grammar.
        return Some(match skip_host_serial(rest) {
            Some(sep) => HostParsed {
                service: &rest[sep + 1..],
                kind: TransportKind::Any,
                serial: Some(&rest[..sep]),
            },
            None => HostParsed {
                service: rest,
                kind: TransportKind::Any,
                serial: None,
            },
        });
    }
    if let Some(rest) = request.strip_prefix("host-usb:") {
        return Some(HostParsed {
            service: rest,
            kind: TransportKind::Usb,
            serial: None,
        });
    }
    if let Some(rest) = request.strip_prefix("host-local:") {
        return Some(HostParsed {
            service: rest,
            kind: TransportKind::Local,
            serial: None,
        });
    }
    if let Some(rest) = request.strip_prefix("host:") {
        return Some(HostParsed {
            service: rest,
            kind: TransportKind::Any,
            serial: None,
        });
    }
    None
}

/// Find the byte offset of the ':' separating a target serial from the
/// command that follows it.
///
/// Serial forms:
///   * `[tcp:|udp:]<serial>[:<port>]:<command>`
///   * `<prefix>:<serial>:<command>` with prefix in {usb, product, model, device}
///
/// The port field must be all decimal digits. Returns `None` when no
/// separator exists.
pub fn skip_host_serial(service: &str) -> Option<usize> {
    const PREFIXES: [&str; 4] = ["usb:", "product:", "model:", "device:"];
    for prefix in PREFIXES {
        if let Some(rest) = service.strip_prefix(prefix) {
            return rest.find(':').map(|i| i + prefix.len());
        }
    }

    let bytes = service.as_bytes();
    let mut base = 0;
    // Protocol prefixes are not part of the serial boundary search.
    if service.starts_with("tcp:") || service.starts_with("udp:") {
        base = 4;
    }
    // A bracketed IPv6 literal keeps its inner colons.
    if bytes.get(base) == Some(&b'[') {
        if let Some(end) = service[base..].find(']') {
            base += end;
        }
    }

    let colon = service[base..].find(':')? + base;

    // "<digits>:" right after the first colon is a port; the separator is
    // the colon that terminates it. Anything else makes the first colon
    // the separator.
    let mut end = colon + 1;
    if bytes.get(end).is_some_and(|c| c.is_ascii_digit()) {
        while bytes.get(end).is_some_and(|c| c.is_ascii_digit()) {
            end += 1;
        }
        if bytes.get(end) == Some(&b':') {
            return Some(end);
        }
    }
    Some(colon)
}

impl<B: ServiceBroker, H: HostRequestHandler> Mux<B, H> {
    /// Pair a freshly accepted local stream with a new smart socket and
    /// start it reading.
    pub fn connect_to_smartsocket(&mut self, h: Handle) {
        debug!("pairing stream with a smart socket");
        let sh = self.sockets.insert(Socket::smart(SmartSocket::new()));
        if let Some(s) = self.sockets.get_mut(sh) {
            s.peer = Some(h);
        }
        if let Some(s) = self.sockets.get_mut(h) {
            s.peer = Some(sh);
        }
        self.ready(h);
    }

    /// Accumulate request bytes; dispatch once a full frame is present.
    pub(crate) fn smart_enqueue(&mut self, h: Handle, p: Packet) -> EnqueueResult {
        let max = self.effective_max_payload(h);

        // Accumulate into the assembly buffer.
        {
            let Some(sock) = self.sockets.get_mut(h) else {
                return EnqueueResult::Closed;
            };
            let SocketKind::Smart(smart) = &mut sock.kind else {
                debug_assert!(false, "smart_enqueue on a non-smart stream");
                return EnqueueResult::Closed;
            };
            trace!(len = p.len(), have = smart.buf.len(), "SS enqueue");
            if !smart.buf.is_empty() && smart.buf.len() + p.len() > max {
                debug!("SS request overflow");
                return self.smart_fail_close(h);
            }
            smart.buf.append(p.data());
        }

        // Nothing to decide until the length header is complete.
        let have = match self.sockets.get(h) {
            Some(sock) => match &sock.kind {
                SocketKind::Smart(smart) => smart.buf.len(),
                _ => return EnqueueResult::Closed,
            },
            None => return EnqueueResult::Closed,
        };
        if have < 4 {
            return EnqueueResult::Ready;
        }

        let len = {
            let Some(sock) = self.sockets.get(h) else {
                return EnqueueResult::Closed;
            };
            let SocketKind::Smart(smart) = &sock.kind else {
                return EnqueueResult::Closed;
            };
            decode_hex_length(&smart.buf.data()[..4]) as usize
        };
        if len < 1 || len > MAX_PAYLOAD_V1 {
            debug!(len, "SS bad request size");
            return self.smart_fail_close(h);
        }
        if 4 + len > have {
            trace!(need = 4 + len - have, "SS waiting for more bytes");
            return EnqueueResult::Ready;
        }

        let request = {
            let Some(sock) = self.sockets.get(h) else {
                return EnqueueResult::Closed;
            };
            let SocketKind::Smart(smart) = &sock.kind else {
                return EnqueueResult::Closed;
            };
            match std::str::from_utf8(&smart.buf.data()[4..4 + len]) {
                Ok(s) => s.to_string(),
                Err(_) => {
                    debug!("SS request is not text");
                    return self.smart_fail_close(h);
                }
            }
        };
        debug!(request = %request, "SS request");

        let Some(peer_h) = self.sockets.get(h).and_then(|s| s.peer) else {
            // The client vanished before the request completed.
            return self.smart_fail_close(h);
        };

        if self.side == Side::Host {
            if let Some(parsed) = parse_host_prefix(&request) {
                return self.smart_host_request(h, peer_h, parsed);
            }
        } else if self.sockets.get(h).is_some_and(|s| s.transport.is_none()) {
            // Device side: requests arrive without a transport; grab one.
            match self.broker.acquire_transport(TransportKind::Any, None) {
                Ok(t) => {
                    if let Some(sock) = self.sockets.get_mut(h) {
                        sock.transport = Some(t);
                    }
                }
                Err(e) => {
                    let line = fail_line(&e.fail_reason());
                    self.send_status_line(peer_h, &line);
                    return self.smart_fail_close(h);
                }
            }
        }

        self.smart_tunnel(h, peer_h, &request)
    }

    /// Dispatch a request carrying a host prefix.
    fn smart_host_request(&mut self, h: Handle, peer_h: Handle, parsed: HostParsed<'_>) -> EnqueueResult {
        let HostParsed {
            service,
            kind,
            serial,
        } = parsed;

        // Administrative requests are answered in place by the handler,
        // which may also record a transport selection.
        let mut selected = self.sockets.get(h).and_then(|s| s.transport.clone());
        let outcome = {
            let handler = &mut self.host_requests;
            match self.sockets.get_mut(peer_h) {
                Some(psock) => match &mut psock.kind {
                    SocketKind::Local(pl) => Some(handler.handle(
                        service,
                        kind,
                        serial,
                        pl.endpoint.as_mut(),
                        &mut selected,
                    )),
                    _ => None,
                },
                None => None,
            }
        };
        let Some(outcome) = outcome else {
            return self.smart_fail_close(h);
        };
        if let Some(sock) = self.sockets.get_mut(h) {
            sock.transport = selected;
        }

        if outcome == HostRequest::Handled {
            // OKAY or FAIL already went out; nothing left to do here.
            debug!(service, "SS host request handled");
            return self.smart_fail_close(h);
        }

        if service.starts_with("transport") {
            // Selection recorded above; the real request comes next on
            // the same connection.
            debug!(service, "SS transport selected");
            if let Some(sock) = self.sockets.get_mut(h) {
                if let SocketKind::Smart(smart) = &mut sock.kind {
                    smart.buf.clear();
                }
            }
            return EnqueueResult::Ready;
        }

        // A service the host itself provides.
        match self.broker.open_host_service(service, serial) {
            None => {
                debug!(service, "SS unknown host service");
                let line = fail_line("unknown host service");
                self.send_status_line(peer_h, &line);
                self.smart_fail_close(h)
            }
            Some(endpoint) => {
                debug!(service, "SS bound to host service");
                self.send_status_line(peer_h, OKAY_LINE);
                if !self.sockets.contains(peer_h) {
                    return self.smart_fail_close(h);
                }
                let sh = self.create_local_socket(endpoint);
                // The client connection goes back to being an ordinary
                // local stream, now paired with the service stream.
                if let Some(psock) = self.sockets.get_mut(peer_h) {
                    if let SocketKind::Local(pl) = &mut psock.kind {
                        pl.status = StatusMode::Normal;
                    }
                    psock.peer = Some(sh);
                }
                if let Some(ssock) = self.sockets.get_mut(sh) {
                    ssock.peer = Some(peer_h);
                }
                if let Some(sock) = self.sockets.get_mut(h) {
                    sock.peer = None;
                }
                self.smart_close(h);
                self.ready(sh);
                EnqueueResult::Ready
            }
        }
    }

    /// Hand the client stream to a transport and request the far side to
    /// open the service.
    fn smart_tunnel(&mut self, h: Handle, peer_h: Handle, request: &str) -> EnqueueResult {
        let transport = self.sockets.get(h).and_then(|s| s.transport.clone());
        let Some(transport) = transport else {
            let line = fail_line("device offline (no transport)");
            self.send_status_line(peer_h, &line);
            return self.smart_fail_close(h);
        };
        if transport.state() == ConnectionState::Offline {
            let line = fail_line("device offline (transport offline)");
            self.send_status_line(peer_h, &line);
            return self.smart_fail_close(h);
        }

        // Rig the client to report the tunnel verdict on its first ready
        // or close, detach it, and ask the far side for the service.
        let Some(psock) = self.sockets.get_mut(peer_h) else {
            return self.smart_fail_close(h);
        };
        psock.transport = Some(transport);
        psock.peer = None;
        if let SocketKind::Local(pl) = &mut psock.kind {
            pl.status = StatusMode::NotifyOnFirst;
        }
        if let Some(sock) = self.sockets.get_mut(h) {
            sock.peer = None;
        }
        self.connect_to_remote(peer_h, request);
        self.smart_close(h);
        EnqueueResult::NotReady
    }

    /// Close after a parse or dispatch failure. The peer goes down with
    /// us, and the caller (who is usually that peer) learns it was
    /// destroyed from the return value.
    fn smart_fail_close(&mut self, h: Handle) -> EnqueueResult {
        self.smart_close(h);
        EnqueueResult::Closed
    }

    /// Remove the smart socket, cascading to any still-attached peer.
    pub(crate) fn smart_close(&mut self, h: Handle) {
        let Some(sock) = self.sockets.get(h) else {
            return;
        };
        debug!("SS close");
        let peer = sock.peer;
        if let Some(ph) = peer {
            if let Some(p) = self.sockets.get_mut(ph) {
                p.peer = None;
            }
            if let Some(s) = self.sockets.get_mut(h) {
                s.peer = None;
            }
            self.close(ph);
        }
        self.sockets.remove(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sep(service: &str) -> Option<usize> {
        skip_host_serial(service)
    }

    #[test]
    fn serial_with_port_stops_at_command() {
        let s = "127.0.0.1:5555:shell:ls";
        assert_eq!(sep(s), Some(14));
        assert_eq!(&s[14..15], ":");
        assert_eq!(&s[15..], "shell:ls");
    }

    #[test]
    fn prefixed_serial_stops_at_first_colon_after_prefix() {
        let s = "usb:1-2:shell:ls";
        assert_eq!(sep(s), Some(7));
        assert_eq!(&s[8..], "shell:ls");

        assert_eq!(sep("product:foo:cmd"), Some(11));
        assert_eq!(sep("model:m:cmd"), Some(7));
        assert_eq!(sep("device:d:cmd"), Some(8));
    }

    #[test]
    fn bracketed_ipv6_serial_keeps_inner_colons() {
        let s = "[::1]:5555:shell:ls";
        assert_eq!(sep(s), Some(10));
        assert_eq!(&s[11..], "shell:ls");
    }

    #[test]
    fn tcp_prefix_is_skipped() {
        let s = "tcp:myhost:1234:cmd";
        assert_eq!(sep(s), Some(15));
        assert_eq!(&s[16..], "cmd");
    }

    #[test]
    fn no_separator_yields_none() {
        assert_eq!(sep("host"), None);
        assert_eq!(sep(""), None);
        assert_eq!(sep("tcp:hostonly"), None);
    }

    #[test]
    fn non_numeric_port_field_is_the_command() {
        // "myhost:shell:ls" - 'shell' is not a port, so the first colon
        // separates.
        let s = "myhost:shell:ls";
        assert_eq!(sep(s), Some(6));
    }

    #[test]
    fn trailing_digits_without_colon_are_the_command() {
        // "host:5555" - the digits end the string, so they are the command
        // field and the first colon separates.
        assert_eq!(sep("myhost:5555"), Some(6));
    }

    #[test]
    fn separator_search_is_idempotent() {
        // Re-running the grammar on the tail it selected lands on the same
        // separator.
        for s in [
            "127.0.0.1:5555:shell:ls",
            "usb:1-2:shell:ls",
            "[::1]:5555:shell:ls",
        ] {
            let first = sep(s).expect("separator");
            let tail = &s[first..];
            assert_eq!(skip_host_serial(tail), Some(0), "input {s}");
        }
    }

    #[test]
    fn host_prefix_parse_extracts_serial() {
        let parsed = parse_host_prefix("host-serial:127.0.0.1:5555:features").expect("prefix");
        assert_eq!(parsed.serial, Some("127.0.0.1:5555"));
        assert_eq!(parsed.service, "features");
        assert_eq!(parsed.kind, TransportKind::Any);

        let parsed = parse_host_prefix("host-usb:version").expect("prefix");
        assert_eq!(parsed.kind, TransportKind::Usb);
        assert_eq!(parsed.service, "version");

        let parsed = parse_host_prefix("host-local:devices").expect("prefix");
        assert_eq!(parsed.kind, TransportKind::Local);

        let parsed = parse_host_prefix("host:kill").expect("prefix");
        assert_eq!(parsed.kind, TransportKind::Any);
        assert_eq!(parsed.service, "kill");

        assert!(parse_host_prefix("shell:echo hi").is_none());
    }

    #[test]
    fn host_serial_without_separator_keeps_whole_tail_as_service() {
        let parsed = parse_host_prefix("host-serial:bare").expect("prefix");
        assert_eq!(parsed.serial, None);
        assert_eq!(parsed.service, "bare");
    }
}
