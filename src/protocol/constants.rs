//! Wire Protocol Constants

// Client header flags
pub const HEADER_VERSION1: u32 = 0x8000_0000;
pub const HEADER_EXTEND: u32 = 0x4000_0000;
pub const RUN_NOW: u32 = 0x0000_0001;

// Record type tags
pub const CLIENTHDRACK: u32 = 0x2;

// Record sizes in bytes
pub const DATAGRAM_HEADER_LEN: usize = 12;
pub const FLAGS_LEN: usize = 4;
pub const LEGACY_FIELDS_LEN: usize = 20;
pub const VERSION_FIELDS_LEN: usize = 8;
pub const CLIENT_HEADER_V1_LEN: usize = FLAGS_LEN + LEGACY_FIELDS_LEN;
pub const CLIENT_HEADER_MAX_LEN: usize = CLIENT_HEADER_V1_LEN + VERSION_FIELDS_LEN;
pub const HEADER_ACK_LEN: usize = 28;
pub const SERVER_SUMMARY_LEN: usize = 40;

/// Largest header the listener may have to hold in its receive buffer.
pub const MAX_HEADER_LEN: usize = max(
    DATAGRAM_HEADER_LEN + CLIENT_HEADER_MAX_LEN,
    max(DATAGRAM_HEADER_LEN + SERVER_SUMMARY_LEN, HEADER_ACK_LEN),
);

// Bounds on the ack send timeout, in microseconds
pub const HDRXACKMIN: u64 = 10_000;
pub const HDRXACKMAX: u64 = 2_500_000;

// Backlog handed to listen() for stream transport
pub const LISTEN_BACKLOG: i32 = 5;

/// Release marker carried in the low half of the minor version word.
const RELEASE_FINAL: u32 = 3;

/// This server's version, major word: `(major << 16) | minor`.
pub const VERSION_MAJOR_HEX: u32 = (parse_u32(env!("CARGO_PKG_VERSION_MAJOR")) << 16)
    | parse_u32(env!("CARGO_PKG_VERSION_MINOR"));

/// This server's version, minor word: `(patch << 16) | release`.
pub const VERSION_MINOR_HEX: u32 = (parse_u32(env!("CARGO_PKG_VERSION_PATCH")) << 16) | RELEASE_FINAL;

const fn parse_u32(s: &str) -> u32 {
    let bytes = s.as_bytes();
    let mut value = 0u32;
    let mut i = 0;
    while i < bytes.len() {
        let digit = bytes[i];
        if digit < b'0' || digit > b'9' {
            break;
        }
        value = value * 10 + (digit - b'0') as u32;
        i += 1;
    }
    value
}

const fn max(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}
