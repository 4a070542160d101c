//! Stream-control commands and the client-side request framing.
//!
//! The framed transport owns byte-level encoding; this layer only stamps
//! commands and arguments into [`ControlPacket`]s and hands them over.

use crate::types::StreamId;

/// The four stream-control commands of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Open a stream to a named service. arg0 = source id, payload = service.
    Open,
    /// Readiness grant. arg0 = source id, arg1 = destination id.
    Okay,
    /// Stream payload bytes. arg0 = source id, arg1 = destination id.
    Write,
    /// Close notification. arg0 = source id (or 0), arg1 = destination id.
    Close,
}

impl Command {
    /// The on-wire command code (ASCII fourcc, little-endian).
    pub const fn code(self) -> u32 {
        match self {
            Command::Open => u32::from_le_bytes(*b"OPEN"),
            Command::Okay => u32::from_le_bytes(*b"OKAY"),
            Command::Write => u32::from_le_bytes(*b"WRTE"),
            Command::Close => u32::from_le_bytes(*b"CLSE"),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Open => "OPEN",
            Command::Okay => "OKAY",
            Command::Write => "WRTE",
            Command::Close => "CLSE",
        };
        f.write_str(name)
    }
}

/// One outbound protocol packet, ready for the framed transport.
#[derive(Debug, Clone)]
pub struct ControlPacket {
    /// Stream-control command.
    pub command: Command,
    /// First argument (source stream id for every command this layer emits).
    pub arg0: u32,
    /// Second argument (destination stream id; 0 for `Open`).
    pub arg1: u32,
    /// Payload bytes. Empty for `Okay` and `Close`.
    pub payload: Vec<u8>,
}

impl ControlPacket {
    /// A payload-free control packet.
    pub fn control(command: Command, arg0: StreamId, arg1: StreamId) -> Self {
        Self {
            command,
            arg0: arg0.raw(),
            arg1: arg1.raw(),
            payload: Vec::new(),
        }
    }
}

/// Value a request length decodes to when any digit is not hex.
pub const BAD_LENGTH: u32 = 0xffff_ffff;

/// Decode the 4-digit ASCII hex length that prefixes a client request.
///
/// Upper and lower case both work. Any byte outside `[0-9A-Fa-f]` poisons
/// the whole decode to [`BAD_LENGTH`], which is out of range for every
/// caller and therefore rejected.
pub fn decode_hex_length(digits: &[u8]) -> u32 {
    let mut n: u32 = 0;
    for &c in digits {
        let v = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => return BAD_LENGTH,
        };
        n = (n << 4) | v as u32;
    }
    n
}

/// Encode a request length as 4 lowercase hex digits.
pub fn encode_hex_length(len: usize) -> [u8; 4] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let n = len as u32;
    [
        DIGITS[(n >> 12 & 0xf) as usize],
        DIGITS[(n >> 8 & 0xf) as usize],
        DIGITS[(n >> 4 & 0xf) as usize],
        DIGITS[(n & 0xf) as usize],
    ]
}

/// The success status line written to a client fd.
pub(crate) const OKAY_LINE: &[u8] = b"OKAY";

/// Build the failure status line written to a client fd:
/// `FAIL` followed by a hex length and the reason text.
pub(crate) fn fail_line(reason: &str) -> Vec<u8> {
    let mut line = Vec::with_capacity(8 + reason.len());
    line.extend_from_slice(b"FAIL");
    line.extend_from_slice(&encode_hex_length(reason.len()));
    line.extend_from_slice(reason.as_bytes());
    line
}
