//! The stream object stored in the arena.
//!
//! Every multiplexed stream, whatever its variant, carries the same spine:
//! an id, an optional symmetric peer link, and an optional transport. The
//! variant payload holds what only that flavor needs. Operations dispatch
//! by matching on [`SocketKind`]; there is no vtable to swap, so the
//! "rewire the peer" tricks of the protocol become plain field updates.

use crate::arena::Handle;
use crate::local::LocalSocket;
use crate::smart::SmartSocket;
use crate::transport::SharedTransport;
use crate::types::StreamId;

/// One endpoint of a multiplexed logical connection.
pub(crate) struct Socket {
    /// Nonzero once installed in the registry (locals only); remotes carry
    /// the id the *other* side allocated.
    pub(crate) id: StreamId,
    /// Symmetric back-reference to the paired stream. Broken on both sides
    /// before either side is closed.
    pub(crate) peer: Option<Handle>,
    /// The framed transport this stream is bound to, if any.
    pub(crate) transport: Option<SharedTransport>,
    /// Variant payload.
    pub(crate) kind: SocketKind,
}

/// The three stream variants.
pub(crate) enum SocketKind {
    /// File-descriptor-backed endpoint.
    Local(LocalSocket),
    /// Transport-packet-backed mirror of a stream on the other side.
    Remote,
    /// Transient request parser that rewires its peer.
    Smart(SmartSocket),
}

impl Socket {
    pub(crate) fn local(id: StreamId, local: LocalSocket) -> Self {
        Self {
            id,
            peer: None,
            transport: None,
            kind: SocketKind::Local(local),
        }
    }

    pub(crate) fn remote(id: StreamId, transport: SharedTransport) -> Self {
        Self {
            id,
            peer: None,
            transport: Some(transport),
            kind: SocketKind::Remote,
        }
    }

    pub(crate) fn smart(smart: SmartSocket) -> Self {
        Self {
            id: StreamId::UNASSIGNED,
            peer: None,
            transport: None,
            kind: SocketKind::Smart(smart),
        }
    }
}
