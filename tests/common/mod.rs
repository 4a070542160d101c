//! Shared test doubles: scripted endpoints, a recording registrar, a
//! capturing transport, and configurable broker/host-handler fakes.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use tether_mux::{
    ConnectionState, ControlPacket, Endpoint, Events, HostRequest, HostRequestHandler, Registrar,
    ServiceError, SharedTransport, Transport, TransportKind,
};

// ============================================================================
// Scripted endpoint
// ============================================================================

#[derive(Default)]
struct EndpointState {
    /// Bytes the stream will read.
    inbound: VecDeque<u8>,
    /// EOF after `inbound` drains.
    eof: bool,
    /// Everything the stream wrote.
    written: Vec<u8>,
    /// Bytes writes may still accept before reporting `WouldBlock`.
    /// `None` means unlimited.
    accept: Option<usize>,
    /// Next write fails hard.
    fail_writes: bool,
    /// Next read fails hard.
    fail_reads: bool,
}

/// Test-side control over a [`ScriptedEndpoint`] that was moved into the mux.
#[derive(Clone)]
pub struct EndpointHandle {
    state: Arc<Mutex<EndpointState>>,
    fd: RawFd,
}

impl EndpointHandle {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Queue bytes for the stream to read.
    pub fn push_read(&self, bytes: &[u8]) {
        self.state.lock().inbound.extend(bytes.iter().copied());
    }

    /// Signal EOF once the queued bytes are consumed.
    pub fn set_eof(&self) {
        self.state.lock().eof = true;
    }

    /// Everything the stream has written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Drop captured writes.
    pub fn clear_written(&self) {
        self.state.lock().written.clear();
    }

    /// Limit how many further bytes writes will accept.
    pub fn set_accept_limit(&self, n: usize) {
        self.state.lock().accept = Some(n);
    }

    /// Remove the write limit again.
    pub fn unlimit(&self) {
        self.state.lock().accept = None;
    }

    /// Make the next write fail hard.
    pub fn fail_writes(&self) {
        self.state.lock().fail_writes = true;
    }

    /// Make the next read fail hard.
    pub fn fail_reads(&self) {
        self.state.lock().fail_reads = true;
    }
}

/// In-memory [`Endpoint`] driven entirely by the test.
pub struct ScriptedEndpoint {
    state: Arc<Mutex<EndpointState>>,
    fd: RawFd,
}

static NEXT_FAKE_FD: AtomicI32 = AtomicI32::new(10_000);

impl ScriptedEndpoint {
    pub fn new() -> (Self, EndpointHandle) {
        let state = Arc::new(Mutex::new(EndpointState::default()));
        let fd = NEXT_FAKE_FD.fetch_add(1, Ordering::Relaxed);
        (
            Self {
                state: state.clone(),
                fd,
            },
            EndpointHandle { state, fd },
        )
    }
}

impl Endpoint for ScriptedEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.fail_reads {
            state.fail_reads = false;
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "scripted"));
        }
        if state.inbound.is_empty() {
            if state.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.inbound.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.inbound.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.fail_writes {
            state.fail_writes = false;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted"));
        }
        let n = match state.accept {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(limit) => buf.len().min(limit),
            None => buf.len(),
        };
        if let Some(limit) = state.accept.as_mut() {
            *limit -= n;
        }
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

// ============================================================================
// Recording registrar
// ============================================================================

/// Registrar that just records the latest interest per fd.
#[derive(Clone, Default)]
pub struct RecordingRegistrar {
    table: Arc<Mutex<HashMap<RawFd, Events>>>,
}

impl RecordingRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interest(&self, fd: RawFd) -> Option<Events> {
        self.table.lock().get(&fd).copied()
    }

    pub fn registered(&self) -> usize {
        self.table.lock().len()
    }
}

impl Registrar for RecordingRegistrar {
    fn update(&self, fd: RawFd, interest: Events) {
        self.table.lock().insert(fd, interest);
    }

    fn remove(&self, fd: RawFd) {
        self.table.lock().remove(&fd);
    }
}

// ============================================================================
// Capturing transport
// ============================================================================

/// Transport that captures every packet instead of framing it.
pub struct FakeTransport {
    kind: TransportKind,
    serial: Option<String>,
    max: usize,
    state: Mutex<ConnectionState>,
    sent: Mutex<Vec<ControlPacket>>,
}

impl FakeTransport {
    pub fn online() -> Arc<Self> {
        Arc::new(Self {
            kind: TransportKind::Any,
            serial: None,
            max: tether_mux::MAX_PAYLOAD,
            state: Mutex::new(ConnectionState::Online),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn with_max_payload(max: usize) -> Arc<Self> {
        Arc::new(Self {
            kind: TransportKind::Any,
            serial: None,
            max,
            state: Mutex::new(ConnectionState::Online),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn shared(self: &Arc<Self>) -> SharedTransport {
        self.clone()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn take_sent(&self) -> Vec<ControlPacket> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn max_payload(&self) -> usize {
        self.max
    }

    fn send(&self, packet: ControlPacket) {
        self.sent.lock().push(packet);
    }
}

// ============================================================================
// Broker and host handler fakes
// ============================================================================

#[derive(Default)]
pub struct BrokerState {
    /// Device-side opens succeed when true.
    pub device_ok: bool,
    /// Host services that resolve.
    pub host_services: Vec<String>,
    /// Transport handed out by `acquire_transport`.
    pub transport: Option<SharedTransport>,
    /// Recorded device-side opens with their endpoint handles.
    pub opened: Vec<(String, EndpointHandle)>,
    /// Recorded host-side opens with their endpoint handles.
    pub host_opened: Vec<(String, Option<String>, EndpointHandle)>,
}

/// Configurable [`tether_mux::ServiceBroker`] fake.
#[derive(Clone, Default)]
pub struct TestBroker(pub Arc<Mutex<BrokerState>>);

impl TestBroker {
    pub fn serving_device() -> Self {
        let broker = Self::default();
        broker.0.lock().device_ok = true;
        broker
    }
}

impl tether_mux::ServiceBroker for TestBroker {
    fn open_device_service(
        &mut self,
        name: &str,
        _transport: Option<&SharedTransport>,
    ) -> Result<Box<dyn Endpoint>, ServiceError> {
        let mut state = self.0.lock();
        if !state.device_ok {
            return Err(ServiceError::NotFound);
        }
        let (endpoint, handle) = ScriptedEndpoint::new();
        state.opened.push((name.to_string(), handle));
        Ok(Box::new(endpoint))
    }

    fn open_host_service(&mut self, name: &str, serial: Option<&str>) -> Option<Box<dyn Endpoint>> {
        let mut state = self.0.lock();
        if !state.host_services.iter().any(|s| s == name) {
            return None;
        }
        let (endpoint, handle) = ScriptedEndpoint::new();
        state
            .host_opened
            .push((name.to_string(), serial.map(str::to_string), handle));
        Some(Box::new(endpoint))
    }

    fn acquire_transport(
        &mut self,
        _kind: TransportKind,
        _serial: Option<&str>,
    ) -> Result<SharedTransport, ServiceError> {
        self.0
            .lock()
            .transport
            .clone()
            .ok_or_else(|| ServiceError::TransportUnavailable("no devices".into()))
    }
}

#[derive(Default)]
pub struct HandlerState {
    /// Transport to record when a `transport...` request comes through.
    pub select: Option<SharedTransport>,
    /// Requests answered in place: service name -> status bytes.
    pub handled: HashMap<String, Vec<u8>>,
    /// Every request seen, with its serial.
    pub requests: Vec<(String, Option<String>)>,
}

/// Configurable [`HostRequestHandler`] fake.
#[derive(Clone, Default)]
pub struct TestHostHandler(pub Arc<Mutex<HandlerState>>);

impl HostRequestHandler for TestHostHandler {
    fn handle(
        &mut self,
        service: &str,
        _kind: TransportKind,
        serial: Option<&str>,
        client: &mut dyn Endpoint,
        selected: &mut Option<SharedTransport>,
    ) -> HostRequest {
        let mut state = self.0.lock();
        state
            .requests
            .push((service.to_string(), serial.map(str::to_string)));
        if let Some(bytes) = state.handled.get(service) {
            let mut rest = bytes.as_slice();
            while !rest.is_empty() {
                match client.write(rest) {
                    Ok(n) => rest = &rest[n..],
                    Err(_) => break,
                }
            }
            return HostRequest::Handled;
        }
        if service.starts_with("transport") {
            *selected = state.select.clone();
        }
        HostRequest::Unhandled
    }
}

// ============================================================================
// Mux construction helpers
// ============================================================================

/// Opt-in log output for debugging test runs: `TETHER_LOG=trace cargo test`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("TETHER_LOG"))
        .with_test_writer()
        .try_init();
}

pub type TestMux = tether_mux::Mux<TestBroker, TestHostHandler>;

/// A mux plus handles to all its fakes.
pub struct Rig {
    pub mux: TestMux,
    pub registrar: RecordingRegistrar,
    pub broker: TestBroker,
    pub handler: TestHostHandler,
}

impl Rig {
    pub fn new(side: tether_mux::Side) -> Self {
        init_tracing();
        let registrar = RecordingRegistrar::new();
        let broker = TestBroker::default();
        let handler = TestHostHandler::default();
        let mux = tether_mux::Mux::new(
            side,
            Arc::new(registrar.clone()),
            broker.clone(),
            handler.clone(),
        );
        Self {
            mux,
            registrar,
            broker,
            handler,
        }
    }

    /// A local stream over a fresh scripted endpoint.
    pub fn local(&mut self) -> (tether_mux::Handle, EndpointHandle) {
        let (endpoint, handle) = ScriptedEndpoint::new();
        let h = self.mux.create_local_socket(Box::new(endpoint));
        (h, handle)
    }

    /// Deliver readiness events to a stream by fd.
    pub fn fire(&mut self, ep: &EndpointHandle, events: Events) {
        self.mux.dispatch_fd(ep.fd(), events);
    }
}
