//! Contract for the framed packet transport.
//!
//! Transports (USB endpoints, TCP links) live outside this crate. The
//! stream layer only needs to stamp control packets and hand them over,
//! ask for the payload ceiling, and check liveness when routing a fresh
//! request. Transports are shared by reference; identity (for
//! transport-wide teardown) is pointer identity.

use std::sync::Arc;

use crate::types::{ConnectionState, TransportKind};
use crate::wire::ControlPacket;

/// A framed packet channel to the other side of the bridge.
pub trait Transport: Send + Sync {
    /// Which class of link this is.
    fn kind(&self) -> TransportKind;

    /// Device serial, if the link is bound to one.
    fn serial(&self) -> Option<&str> {
        None
    }

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Largest payload one packet may carry on this link.
    fn max_payload(&self) -> usize;

    /// Queue a packet for the wire. The transport owns its flow control;
    /// the call never blocks the stream layer.
    fn send(&self, packet: ControlPacket);
}

/// Shared handle to a transport.
pub type SharedTransport = Arc<dyn Transport>;

/// True if both handles refer to the same transport instance.
pub fn same_transport(a: &SharedTransport, b: &SharedTransport) -> bool {
    Arc::ptr_eq(a, b)
}
