//! peerdex wire format — the registry protocol.
//!
//! Three requests travel peer → registry (JOIN, PUBLISH, SEARCH) and one
//! reply travels registry → peer (the SEARCH reply). There is no length
//! prefix: every message's size follows from its opcode and, for PUBLISH,
//! the declared file count.
//!
//! All multi-byte integers are network byte order. Fixed-layout parts are
//! #[repr(C, packed)] zerocopy types so the byte layout is the type.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Opcodes ───────────────────────────────────────────────────────────────────

/// First byte of every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Join = 0x01,
    Publish = 0x02,
    Search = 0x03,
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Opcode::Join),
            0x02 => Ok(Opcode::Publish),
            0x03 => Ok(Opcode::Search),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

// ── Fixed layouts ─────────────────────────────────────────────────────────────

/// JOIN body, following the opcode byte.
///
/// Wire size: 4 bytes (5 with the opcode).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct JoinBody {
    /// Caller-chosen peer identity. Not authenticated.
    pub peer_id: U32<NetworkEndian>,
}

assert_eq_size!(JoinBody, [u8; 4]);

/// PUBLISH header, following the opcode byte.
///
/// Followed by `file_count` filename blocks of exactly
/// `WireLimits::max_filename_len` bytes each, NUL-terminated and NUL-padded.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PublishHeader {
    pub file_count: U32<NetworkEndian>,
}

assert_eq_size!(PublishHeader, [u8; 4]);

/// Registry's answer to a SEARCH.
///
/// All fields zero means no joined peer holds the file.
///
/// Wire size: 10 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct SearchReply {
    pub peer_id: U32<NetworkEndian>,
    /// IPv4 address octets, most significant first.
    pub ipv4: [u8; 4],
    pub port: U16<NetworkEndian>,
}

assert_eq_size!(SearchReply, [u8; 10]);

/// Size of the opcode plus the JOIN body.
pub const JOIN_LEN: usize = 1 + std::mem::size_of::<JoinBody>();

/// Size of the opcode plus the PUBLISH header.
pub const PUBLISH_HEADER_LEN: usize = 1 + std::mem::size_of::<PublishHeader>();

/// Size of a SEARCH reply.
pub const SEARCH_REPLY_LEN: usize = std::mem::size_of::<SearchReply>();

/// Where a file can be fetched from: the holder's id and the address the
/// registry observed for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLocation {
    pub peer_id: u32,
    pub endpoint: SocketAddrV4,
}

impl SearchReply {
    /// The all-zero sentinel.
    pub fn not_found() -> Self {
        Self::new_zeroed()
    }

    pub fn found(peer_id: u32, endpoint: SocketAddrV4) -> Self {
        Self {
            peer_id: U32::new(peer_id),
            ipv4: endpoint.ip().octets(),
            port: U16::new(endpoint.port()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }

    /// The holder, or `None` for the sentinel.
    pub fn location(&self) -> Option<PeerLocation> {
        if self.is_not_found() {
            return None;
        }
        Some(PeerLocation {
            peer_id: self.peer_id.get(),
            endpoint: SocketAddrV4::new(Ipv4Addr::from(self.ipv4), self.port.get()),
        })
    }

    /// Parse a reply from exactly `SEARCH_REPLY_LEN` bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Self::read_from(bytes)
    }
}

impl From<Option<PeerLocation>> for SearchReply {
    fn from(location: Option<PeerLocation>) -> Self {
        match location {
            Some(loc) => SearchReply::found(loc.peer_id, loc.endpoint),
            None => SearchReply::not_found(),
        }
    }
}

// ── Limits ────────────────────────────────────────────────────────────────────

/// Default maximum number of files in one PUBLISH.
pub const DEFAULT_MAX_FILES: usize = 10;

/// Default filename block width, terminator included.
pub const DEFAULT_MAX_FILENAME_LEN: usize = 100;

/// Default ceiling on the size of any single request.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024;

/// Bounds shared by both ends of the protocol. Both sides must agree on
/// `max_filename_len` since it fixes the PUBLISH block width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireLimits {
    pub max_files: usize,
    pub max_filename_len: usize,
    pub max_message_bytes: usize,
}

impl Default for WireLimits {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
            max_filename_len: DEFAULT_MAX_FILENAME_LEN,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl WireLimits {
    /// Total size of a PUBLISH carrying `count` files, or `None` on overflow.
    pub fn publish_len(&self, count: usize) -> Option<usize> {
        count
            .checked_mul(self.max_filename_len)
            .and_then(|blocks| blocks.checked_add(PUBLISH_HEADER_LEN))
    }

    /// Check a file count against both the count and size ceilings.
    fn check_publish(&self, count: usize) -> Result<usize, WireError> {
        if count > self.max_files {
            return Err(WireError::TooManyFiles {
                count,
                max: self.max_files,
            });
        }
        match self.publish_len(count) {
            Some(len) if len <= self.max_message_bytes => Ok(len),
            Some(len) => Err(WireError::MessageTooLarge {
                len,
                max: self.max_message_bytes,
            }),
            None => Err(WireError::MessageTooLarge {
                len: usize::MAX,
                max: self.max_message_bytes,
            }),
        }
    }

    /// Check a filename for encoding. The terminator counts against the bound.
    fn check_filename(&self, name: &str) -> Result<(), WireError> {
        if name.is_empty() {
            return Err(WireError::EmptyFilename);
        }
        if name.as_bytes().contains(&0) {
            return Err(WireError::InvalidFilename);
        }
        if name.len() + 1 > self.max_filename_len {
            return Err(WireError::FilenameTooLong {
                len: name.len(),
                max: self.max_filename_len,
            });
        }
        Ok(())
    }
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// A decoded peer → registry message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Join { peer_id: u32 },
    Publish { files: Vec<String> },
    Search { filename: String },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Join { .. } => Opcode::Join,
            Request::Publish { .. } => Opcode::Publish,
            Request::Search { .. } => Opcode::Search,
        }
    }

    /// Append the wire encoding of this request to `dst`.
    ///
    /// Fails without writing anything if the request exceeds `limits`.
    pub fn encode(&self, limits: &WireLimits, dst: &mut BytesMut) -> Result<(), WireError> {
        match self {
            Request::Join { peer_id } => {
                let body = JoinBody {
                    peer_id: U32::new(*peer_id),
                };
                dst.reserve(JOIN_LEN);
                dst.put_u8(Opcode::Join.into());
                dst.put_slice(body.as_bytes());
            }
            Request::Publish { files } => {
                let len = limits.check_publish(files.len())?;
                for name in files {
                    limits.check_filename(name)?;
                }
                let header = PublishHeader {
                    file_count: U32::new(files.len() as u32),
                };
                dst.reserve(len);
                dst.put_u8(Opcode::Publish.into());
                dst.put_slice(header.as_bytes());
                for name in files {
                    dst.put_slice(name.as_bytes());
                    dst.put_bytes(0, limits.max_filename_len - name.len());
                }
            }
            Request::Search { filename } => {
                limits.check_filename(filename)?;
                dst.reserve(filename.len() + 2);
                dst.put_u8(Opcode::Search.into());
                dst.put_slice(filename.as_bytes());
                dst.put_u8(0);
            }
        }
        Ok(())
    }
}

// ── Decoder ───────────────────────────────────────────────────────────────────

/// Resumable request decoder over a per-connection read buffer.
///
/// `decode` never consumes a partial message: it either removes exactly one
/// complete request from the front of the buffer, asks for more bytes, or
/// reports a protocol violation. A violation leaves the stream unusable.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestDecoder {
    limits: WireLimits,
}

impl RequestDecoder {
    pub fn new(limits: WireLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &WireLimits {
        &self.limits
    }

    /// Decode one request from the front of `src`.
    ///
    /// `Ok(None)` means the buffered bytes are a valid prefix; read more.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Request>, WireError> {
        let Some(&op) = src.first() else {
            return Ok(None);
        };

        match Opcode::try_from(op)? {
            Opcode::Join => {
                if src.len() < JOIN_LEN {
                    return Ok(None);
                }
                let body = JoinBody::read_from(&src[1..JOIN_LEN]).ok_or(WireError::Truncated {
                    buffered: src.len(),
                })?;
                src.advance(JOIN_LEN);
                Ok(Some(Request::Join {
                    peer_id: body.peer_id.get(),
                }))
            }
            Opcode::Publish => {
                if src.len() < PUBLISH_HEADER_LEN {
                    return Ok(None);
                }
                let header = PublishHeader::read_from(&src[1..PUBLISH_HEADER_LEN]).ok_or(
                    WireError::Truncated {
                        buffered: src.len(),
                    },
                )?;
                let count = header.file_count.get() as usize;
                let len = self.limits.check_publish(count)?;
                if src.len() < len {
                    return Ok(None);
                }
                let files = src[PUBLISH_HEADER_LEN..len]
                    .chunks_exact(self.limits.max_filename_len)
                    .map(|block| self.filename_in(block))
                    .collect::<Result<Vec<_>, _>>()?;
                src.advance(len);
                Ok(Some(Request::Publish { files }))
            }
            Opcode::Search => {
                let window = &src[1..src.len().min(1 + self.limits.max_filename_len)];
                match window.iter().position(|&b| b == 0) {
                    Some(end) => {
                        let filename = self.filename_in(&window[..=end])?;
                        src.advance(end + 2);
                        Ok(Some(Request::Search { filename }))
                    }
                    None if window.len() >= self.limits.max_filename_len => {
                        Err(WireError::UnterminatedFilename {
                            max: self.limits.max_filename_len,
                        })
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// Decode at end of stream. Leftover bytes that do not form a complete
    /// request mean the peer hung up mid-message.
    pub fn decode_eof(&self, src: &mut BytesMut) -> Result<Option<Request>, WireError> {
        match self.decode(src)? {
            Some(request) => Ok(Some(request)),
            None if src.is_empty() => Ok(None),
            None => Err(WireError::Truncated {
                buffered: src.len(),
            }),
        }
    }

    /// Extract the NUL-terminated name from a bounded block.
    fn filename_in(&self, block: &[u8]) -> Result<String, WireError> {
        let end = block
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::UnterminatedFilename {
                max: self.limits.max_filename_len,
            })?;
        if end == 0 {
            return Err(WireError::EmptyFilename);
        }
        std::str::from_utf8(&block[..end])
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidFilename)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Protocol violations. Any of these ends the offending connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("publish declares {count} files, maximum is {max}")]
    TooManyFiles { count: usize, max: usize },

    #[error("message of {len} bytes exceeds maximum {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("filename not terminated within {max} bytes")]
    UnterminatedFilename { max: usize },

    #[error("filename of {len} bytes does not fit a {max}-byte block")]
    FilenameTooLong { len: usize, max: usize },

    #[error("empty filename")]
    EmptyFilename,

    #[error("filename is not valid UTF-8 or contains NUL")]
    InvalidFilename,

    #[error("stream ended mid-message with {buffered} bytes buffered")]
    Truncated { buffered: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
