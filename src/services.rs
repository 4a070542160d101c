//! Contracts for the service dispatcher and the host request handler.
//!
//! The mux turns parsed requests into calls on these traits and turns
//! their failures into `FAIL` lines on the client fd. What the services
//! actually do (shells, file sync, port forwards, device administration)
//! is none of this crate's business.

use crate::endpoint::Endpoint;
use crate::error::ServiceError;
use crate::transport::SharedTransport;
use crate::types::TransportKind;

/// Opens services by name.
pub trait ServiceBroker {
    /// Open a device-side service, returning the byte endpoint the new
    /// local stream will wrap.
    fn open_device_service(
        &mut self,
        name: &str,
        transport: Option<&SharedTransport>,
    ) -> Result<Box<dyn Endpoint>, ServiceError>;

    /// Open a host-side service (e.g. `track-devices`). `None` means no
    /// such service; the requesting client gets a `FAIL`.
    fn open_host_service(&mut self, name: &str, serial: Option<&str>) -> Option<Box<dyn Endpoint>>;

    /// Pick a transport for a request that arrived without one (device
    /// side, or host side before any `transport` request ran).
    fn acquire_transport(
        &mut self,
        kind: TransportKind,
        serial: Option<&str>,
    ) -> Result<SharedTransport, ServiceError>;
}

/// Whether the host handler consumed a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRequest {
    /// The handler already wrote OKAY/FAIL to the client; tear down.
    Handled,
    /// Not an administrative request; keep resolving it as a service.
    Unhandled,
}

/// Services `host:*` administrative requests in-line.
pub trait HostRequestHandler {
    /// Handle a request addressed to the host itself. `client` is the
    /// requesting connection's endpoint, for writing the status line.
    /// `transport`-selection requests record their choice in `selected`,
    /// which the smart socket consults for every following request on the
    /// same connection.
    fn handle(
        &mut self,
        service: &str,
        kind: TransportKind,
        serial: Option<&str>,
        client: &mut dyn Endpoint,
        selected: &mut Option<SharedTransport>,
    ) -> HostRequest;
}

/// Broker/handler for processes that serve no services of their own.
///
/// Every lookup fails and every host request is left unhandled. Useful as
/// a placeholder in tests and in tools that only tunnel.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoServices;

impl ServiceBroker for NoServices {
    fn open_device_service(
        &mut self,
        _name: &str,
        _transport: Option<&SharedTransport>,
    ) -> Result<Box<dyn Endpoint>, ServiceError> {
        Err(ServiceError::NotFound)
    }

    fn open_host_service(
        &mut self,
        _name: &str,
        _serial: Option<&str>,
    ) -> Option<Box<dyn Endpoint>> {
        None
    }

    fn acquire_transport(
        &mut self,
        _kind: TransportKind,
        _serial: Option<&str>,
    ) -> Result<SharedTransport, ServiceError> {
        Err(ServiceError::TransportUnavailable("no transport".into()))
    }
}

impl HostRequestHandler for NoServices {
    fn handle(
        &mut self,
        _service: &str,
        _kind: TransportKind,
        _serial: Option<&str>,
        _client: &mut dyn Endpoint,
        _selected: &mut Option<SharedTransport>,
    ) -> HostRequest {
        HostRequest::Unhandled
    }
}
