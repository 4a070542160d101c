//! Socket multiplexing core of the tether host-device debug bridge.
//!
//! Many logical byte streams ride one framed packet transport. Each
//! stream shows up on this side as a file descriptor driven by readiness
//! events, and on the other side as `OPEN`/`OKAY`/`WRTE`/`CLSE` packets
//! routed by numeric stream ids. This crate owns the stream lifecycle:
//! id allocation, pairing and teardown of peer streams, receiver-driven
//! flow control, write backlogs with deferred destruction, and the
//! smart-socket request parser that rewires a freshly accepted client
//! connection into whatever it asked for.
//!
//! The framed transport, the event loop, and the service implementations
//! are collaborators behind traits ([`Transport`], [`Registrar`],
//! [`ServiceBroker`], [`HostRequestHandler`]); a minimal `poll(2)` reactor
//! is included for single-threaded deployments.

mod arena;
mod local;
mod mux;
mod packet;
mod registry;
mod remote;
mod smart;
mod socket;

pub mod endpoint;
pub mod error;
pub mod reactor;
pub mod services;
pub mod transport;
pub mod types;
pub mod wire;

pub use arena::Handle;
pub use endpoint::{endpoint_pair, Endpoint, FdEndpoint};
pub use error::ServiceError;
pub use mux::Mux;
pub use packet::Packet;
pub use reactor::{Events, PollReactor, Registrar};
pub use services::{HostRequest, HostRequestHandler, NoServices, ServiceBroker};
pub use smart::skip_host_serial;
pub use transport::{same_transport, SharedTransport, Transport};
pub use types::{ConnectionState, EnqueueResult, Side, StreamId, TransportKind};
pub use wire::{decode_hex_length, encode_hex_length, Command, ControlPacket};

/// Largest payload a packet may carry anywhere in the bridge.
pub const MAX_PAYLOAD: usize = 256 * 1024;

/// Payload cap of the first protocol revision. Client requests on the
/// smart socket are still framed against this limit.
pub const MAX_PAYLOAD_V1: usize = 4 * 1024;

/// Unrecoverable programming or resource-exhaustion error.
pub(crate) fn fatal(msg: &str) -> ! {
    tracing::error!("fatal: {msg}");
    std::process::abort();
}
