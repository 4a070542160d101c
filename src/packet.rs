//! Byte buffer with a read cursor, the unit of data moved between streams.
//!
//! A packet is produced in one piece (a single fd read, or one inbound wire
//! payload) and consumed incrementally: partial fd writes advance the cursor
//! and leave the rest for the next writable event.

/// A fixed-capacity byte buffer with a read cursor.
pub struct Packet {
    data: Vec<u8>,
    pos: usize,
}

impl Packet {
    /// Create an empty packet that can hold up to `cap` bytes.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap),
            pos: 0,
        }
    }

    /// Create a packet holding a copy of `bytes`, cursor at the start.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            pos: 0,
        }
    }

    /// Take ownership of an already-filled buffer, cursor at the start.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    /// Total number of bytes held (independent of the cursor).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if no bytes are held at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Capacity this packet was allocated with.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// The bytes still to be consumed.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Advance the read cursor after a (possibly partial) write.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.data.len());
        self.pos += n;
    }

    /// True once every byte has been consumed.
    pub fn is_drained(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// All held bytes, ignoring the cursor.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of all held bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Append bytes at the end. The caller is responsible for bounding the
    /// total size; the buffer itself grows as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Discard all contents and reset the cursor.
    pub fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }

    /// Consume the packet, yielding the not-yet-read bytes.
    pub fn into_payload(mut self) -> Vec<u8> {
        if self.pos == 0 {
            self.data
        } else {
            self.data.split_off(self.pos)
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.data.len())
            .field("pos", &self.pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_tracks_partial_consumption() {
        let mut p = Packet::from_slice(b"ABCDEFGHIJ");
        assert_eq!(p.unread(), b"ABCDEFGHIJ");
        p.advance(3);
        assert_eq!(p.unread(), b"DEFGHIJ");
        assert!(!p.is_drained());
        p.advance(7);
        assert!(p.is_drained());
        assert!(p.unread().is_empty());
    }

    #[test]
    fn append_grows_contents() {
        let mut p = Packet::from_slice(b"000C");
        p.append(b"shell:echo");
        assert_eq!(p.data(), b"000Cshell:echo");
        assert_eq!(p.len(), 14);
    }

    #[test]
    fn clear_resets_cursor() {
        let mut p = Packet::from_slice(b"abc");
        p.advance(2);
        p.clear();
        assert!(p.is_empty());
        assert!(p.is_drained());
    }

    #[test]
    fn into_payload_honors_cursor() {
        let mut p = Packet::from_slice(b"hello");
        p.advance(2);
        assert_eq!(p.into_payload(), b"llo");
        let q = Packet::from_slice(b"hello");
        assert_eq!(q.into_payload(), b"hello");
    }
}
