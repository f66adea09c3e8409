//! Wire Record Types
//!
//! Fixed-layout records exchanged with test clients. All integers are
//! big-endian and every field is 4 bytes wide.
//!
//! ```text
//! client header   flags | [num_threads port buffer_len win_band amount] | [version_major version_minor]
//!                         ^ present with HEADER_VERSION1                   ^ present with HEADER_EXTEND
//! header ack      type | length | flags | reserved1 | reserved2 | version_major | version_minor
//! datagram marker id (signed) | tv_sec | tv_usec
//! server summary  flags | total_hi | total_lo | stop_sec | stop_usec | errors | out_of_order
//!                 | datagrams | jitter_sec | jitter_usec
//! ```

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::protocol::constants::*;

/// Decoding failures for fixed-layout records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("record truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unexpected record type {0:#x}")]
    UnexpectedType(u32),
}

fn ensure_len(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Protocol version advertised by one side of the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerVersion {
    pub major: u32,
    pub minor: u32,
}

impl PeerVersion {
    /// The version compiled into this server.
    pub fn server() -> Self {
        Self {
            major: VERSION_MAJOR_HEX,
            minor: VERSION_MINOR_HEX,
        }
    }
}

impl fmt::Display for PeerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.major >> 16,
            self.major & 0xffff,
            self.minor >> 16
        )
    }
}

/// Fields of the legacy (version 1) client header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LegacyFields {
    pub num_threads: i32,
    pub port: i32,
    pub buffer_len: i32,
    pub win_band: i32,
    pub amount: i32,
}

/// Optional header a client sends ahead of its test traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHeader {
    pub flags: u32,
    pub legacy: Option<LegacyFields>,
    pub version: Option<PeerVersion>,
}

impl ClientHeader {
    /// Read only the flags word.
    pub fn peek_flags(buf: &[u8]) -> Result<u32, CodecError> {
        ensure_len(buf, FLAGS_LEN)?;
        Ok((&buf[..FLAGS_LEN]).get_u32())
    }

    /// Number of bytes a header with these flags occupies on the wire.
    pub fn encoded_len(flags: u32) -> usize {
        let mut len = FLAGS_LEN;
        if flags & HEADER_VERSION1 != 0 {
            len += LEGACY_FIELDS_LEN;
        }
        if flags & HEADER_EXTEND != 0 {
            len += VERSION_FIELDS_LEN;
        }
        len
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let flags = Self::peek_flags(buf)?;
        ensure_len(buf, Self::encoded_len(flags))?;

        let mut cursor = &buf[FLAGS_LEN..];
        let legacy = if flags & HEADER_VERSION1 != 0 {
            Some(LegacyFields {
                num_threads: cursor.get_i32(),
                port: cursor.get_i32(),
                buffer_len: cursor.get_i32(),
                win_band: cursor.get_i32(),
                amount: cursor.get_i32(),
            })
        } else {
            None
        };
        let version = if flags & HEADER_EXTEND != 0 {
            Some(PeerVersion {
                major: cursor.get_u32(),
                minor: cursor.get_u32(),
            })
        } else {
            None
        };

        Ok(Self {
            flags,
            legacy,
            version,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(Self::encoded_len(self.flags));
        out.put_u32(self.flags);
        if self.flags & HEADER_VERSION1 != 0 {
            let legacy = self.legacy.unwrap_or_default();
            out.put_i32(legacy.num_threads);
            out.put_i32(legacy.port);
            out.put_i32(legacy.buffer_len);
            out.put_i32(legacy.win_band);
            out.put_i32(legacy.amount);
        }
        if self.flags & HEADER_EXTEND != 0 {
            let version = self.version.unwrap_or(PeerVersion { major: 0, minor: 0 });
            out.put_u32(version.major);
            out.put_u32(version.minor);
        }
        out
    }

    pub fn is_extended(&self) -> bool {
        self.flags & HEADER_EXTEND != 0
    }

    pub fn run_now(&self) -> bool {
        self.flags & RUN_NOW != 0
    }
}

/// Acknowledgment sent back to a client that sent an extended header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderAck {
    pub flags: u32,
    pub version: PeerVersion,
}

impl HeaderAck {
    /// Ack carrying this server's own version.
    pub fn for_server() -> Self {
        Self {
            flags: 0,
            version: PeerVersion::server(),
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(HEADER_ACK_LEN);
        out.put_u32(CLIENTHDRACK);
        out.put_u32(HEADER_ACK_LEN as u32);
        out.put_u32(self.flags);
        out.put_u32(0);
        out.put_u32(0);
        out.put_u32(self.version.major);
        out.put_u32(self.version.minor);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        ensure_len(buf, HEADER_ACK_LEN)?;
        let mut cursor = buf;
        let kind = cursor.get_u32();
        if kind != CLIENTHDRACK {
            return Err(CodecError::UnexpectedType(kind));
        }
        let _length = cursor.get_u32();
        let flags = cursor.get_u32();
        cursor.advance(8);
        Ok(Self {
            flags,
            version: PeerVersion {
                major: cursor.get_u32(),
                minor: cursor.get_u32(),
            },
        })
    }
}

/// Sequence id and send timestamp at the head of every test datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramMarker {
    pub id: i32,
    pub tv_sec: u32,
    pub tv_usec: u32,
}

impl DatagramMarker {
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        ensure_len(buf, DATAGRAM_HEADER_LEN)?;
        let mut cursor = buf;
        Ok(Self {
            id: cursor.get_i32(),
            tv_sec: cursor.get_u32(),
            tv_usec: cursor.get_u32(),
        })
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        out.put_i32(self.id);
        out.put_u32(self.tv_sec);
        out.put_u32(self.tv_usec);
    }

    /// A negative id marks the last datagram of a flow.
    pub fn is_termination(&self) -> bool {
        self.id < 0
    }

    /// Sequence number with the termination sign stripped.
    pub fn sequence(&self) -> u32 {
        self.id.unsigned_abs()
    }
}

/// Totals the server reports back in the terminal datagram of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerSummary {
    pub flags: u32,
    pub total_bytes: u64,
    pub stop_sec: u32,
    pub stop_usec: u32,
    pub errors: u32,
    pub out_of_order: u32,
    pub datagrams: u32,
    pub jitter_sec: u32,
    pub jitter_usec: u32,
}

impl ServerSummary {
    /// Write the summary at the start of `out`.
    pub fn write_into(&self, out: &mut [u8]) -> Result<(), CodecError> {
        ensure_len(out, SERVER_SUMMARY_LEN)?;
        let mut cursor = &mut out[..SERVER_SUMMARY_LEN];
        cursor.put_u32(self.flags);
        cursor.put_u32((self.total_bytes >> 32) as u32);
        cursor.put_u32((self.total_bytes & 0xFFFF_FFFF) as u32);
        cursor.put_u32(self.stop_sec);
        cursor.put_u32(self.stop_usec);
        cursor.put_u32(self.errors);
        cursor.put_u32(self.out_of_order);
        cursor.put_u32(self.datagrams);
        cursor.put_u32(self.jitter_sec);
        cursor.put_u32(self.jitter_usec);
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        ensure_len(buf, SERVER_SUMMARY_LEN)?;
        let mut cursor = buf;
        let flags = cursor.get_u32();
        let hi = cursor.get_u32() as u64;
        let lo = cursor.get_u32() as u64;
        Ok(Self {
            flags,
            total_bytes: (hi << 32) | lo,
            stop_sec: cursor.get_u32(),
            stop_usec: cursor.get_u32(),
            errors: cursor.get_u32(),
            out_of_order: cursor.get_u32(),
            datagrams: cursor.get_u32(),
            jitter_sec: cursor.get_u32(),
            jitter_usec: cursor.get_u32(),
        })
    }
}
