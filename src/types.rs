//! Core identifier and status types shared across the crate.

/// Identifier of a multiplexed stream.
///
/// Zero means "not yet installed" for a local stream, and is never valid on
/// the wire as a source id. Installed local streams always carry a nonzero,
/// process-unique id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct StreamId(pub u32);

impl StreamId {
    /// The "not installed" sentinel.
    pub const UNASSIGNED: Self = Self(0);

    /// Create a new stream ID.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw u32 value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check whether this id has been assigned yet.
    pub const fn is_unassigned(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<StreamId> for u32 {
    fn from(id: StreamId) -> Self {
        id.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which end of the bridge this process is.
///
/// The smart-socket request parser behaves differently on each side: the
/// host understands `host:`-prefixed administrative requests, the device
/// auto-acquires a transport for requests that arrive without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The host process (talks to many devices).
    Host,
    /// The device daemon (serves one transport).
    Device,
}

/// Transport class requested by a host service prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Any available transport.
    Any,
    /// USB-attached transports only.
    Usb,
    /// TCP/local-network transports only.
    Local,
}

/// Connection state of a transport as seen by the stream layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The device went away or never finished connecting.
    Offline,
    /// Handshake in progress.
    Connecting,
    /// Fully connected and usable.
    Online,
}

/// Result of pushing a packet into a stream.
///
/// The caller uses this to drive flow control: `Ready` means "send more",
/// `NotReady` means "pause until my `ready()` fires", and `Closed` means the
/// call closed the *caller* as a side effect - the caller must return
/// immediately without touching its own state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// The packet was fully consumed; the producer may keep going.
    Ready,
    /// The packet was accepted but the receiver is saturated.
    NotReady,
    /// The receiver closed its peer (the caller) while handling the packet.
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_sentinel() {
        assert!(StreamId::UNASSIGNED.is_unassigned());
        assert!(!StreamId::new(1).is_unassigned());
        assert_eq!(StreamId::new(7).raw(), 7);
        assert_eq!(u32::from(StreamId::from(9u32)), 9);
    }

    #[test]
    fn stream_id_display_is_raw() {
        assert_eq!(StreamId::new(42).to_string(), "42");
    }
}
