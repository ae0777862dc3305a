//! Box wire format — on-wire types for all Box communication.
//!
//! These types ARE the protocol. Every field, every size, every reserved
//! byte is part of the wire format; changing anything here is a breaking
//! change for every deployed node.
//!
//! A frame is a 58-byte header followed by a command-specific payload.
//! All multi-byte integers are big-endian. The header is #[repr(C, packed)]
//! with zerocopy derives for deterministic layout and allocation-free
//! serialization. There is no unsafe code in this module.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use uuid::Uuid;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// First byte of every frame.
pub const MAGIC: u8 = 0x42;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Protocol versions this build can speak, advertised in HELLO.
pub const SUPPORTED_VERSIONS: &[u16] = &[1];

/// Protocol version negotiated by the HELLO exchange.
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 58;

/// Bytes covered by the remainder-length field, excluding the payload:
/// command code (4) + request/node/user UUIDs (48).
const REMAINDER_BASE: usize = 52;

/// Maximum payload size in bytes. Chunking above this is the caller's job.
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

// ── Header ────────────────────────────────────────────────────────────────────

/// The fixed 58-byte frame header.
///
/// The remainder field counts every byte after itself: the command code,
/// the three UUIDs, and the payload.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    pub magic: u8,
    pub version: u8,
    pub remainder: U32<BigEndian>,
    pub command: U32<BigEndian>,
    pub request_id: [u8; 16],
    pub node_id: [u8; 16],
    pub user_id: [u8; 16],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 58]);

// ── Commands & status codes ───────────────────────────────────────────────────

/// Protocol command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Hello = 1,
    Put = 2,
    Get = 3,
    Delete = 4,
    Status = 5,
    Search = 6,
    Bye = 7,
    Locate = 8,
}

impl TryFrom<u32> for Command {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Command::Hello),
            2 => Ok(Command::Put),
            3 => Ok(Command::Get),
            4 => Ok(Command::Delete),
            5 => Ok(Command::Status),
            6 => Ok(Command::Search),
            7 => Ok(Command::Bye),
            8 => Ok(Command::Locate),
            other => Err(WireError::UnsupportedCommand(other)),
        }
    }
}

impl From<Command> for u32 {
    fn from(c: Command) -> u32 {
        c as u32
    }
}

/// One-byte status codes carried in STATUS (and HELLO) payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    Unauthorized = 1,
    Forbidden = 2,
    NotFound = 3,
    Conflict = 4,
    BadRequest = 5,
    TooLarge = 6,
    RateLimited = 7,
    InternalError = 8,
}

impl TryFrom<u8> for StatusCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::Unauthorized),
            2 => Ok(StatusCode::Forbidden),
            3 => Ok(StatusCode::NotFound),
            4 => Ok(StatusCode::Conflict),
            5 => Ok(StatusCode::BadRequest),
            6 => Ok(StatusCode::TooLarge),
            7 => Ok(StatusCode::RateLimited),
            8 => Ok(StatusCode::InternalError),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

impl From<StatusCode> for u8 {
    fn from(s: StatusCode) -> u8 {
        s as u8
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// A decoded frame. The payload borrows from the input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    pub command: Command,
    pub request_id: Uuid,
    pub node_id: Uuid,
    pub user_id: Uuid,
    pub payload: &'a [u8],
}

/// Encode a frame: 58-byte header followed by the payload verbatim.
pub fn encode_frame(
    command: Command,
    request_id: Uuid,
    node_id: Uuid,
    user_id: Uuid,
    payload: &[u8],
) -> Result<Bytes, WireError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }
    let remainder = REMAINDER_BASE + payload.len();

    let header = FrameHeader {
        magic: MAGIC,
        version: WIRE_VERSION,
        remainder: U32::new(remainder as u32),
        command: U32::new(command.into()),
        request_id: *request_id.as_bytes(),
        node_id: *node_id.as_bytes(),
        user_id: *user_id.as_bytes(),
    };

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode a frame from a datagram.
///
/// On success the returned payload is a view into `buf`; nothing is copied.
pub fn decode_frame(buf: &[u8]) -> Result<Frame<'_>, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::BufferTooShort {
            need: HEADER_LEN,
            got: buf.len(),
        });
    }

    let header = FrameHeader::read_from_prefix(buf).ok_or(WireError::BufferTooShort {
        need: HEADER_LEN,
        got: buf.len(),
    })?;

    if header.magic != MAGIC {
        return Err(WireError::BadMagic(header.magic));
    }
    if header.version != WIRE_VERSION {
        return Err(WireError::BadVersion(header.version));
    }

    // The remainder counts everything after the length field itself.
    let declared = header.remainder.get() as usize;
    let actual = buf.len() - 6;
    if declared != actual {
        return Err(WireError::LengthMismatch { declared, actual });
    }

    let payload = &buf[HEADER_LEN..];
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }

    let command = Command::try_from(header.command.get())?;

    Ok(Frame {
        command,
        request_id: Uuid::from_bytes(header.request_id),
        node_id: Uuid::from_bytes(header.node_id),
        user_id: Uuid::from_bytes(header.user_id),
        payload,
    })
}

// ── Payload reader ────────────────────────────────────────────────────────────

/// Cursor over a payload buffer. Every read is bounds-checked.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::TruncatedPayload(what));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, WireError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, WireError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, WireError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn uuid(&mut self, what: &'static str) -> Result<Uuid, WireError> {
        let b = self.take(16, what)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(b);
        Ok(Uuid::from_bytes(raw))
    }

    fn text(&mut self, len: usize, what: &'static str) -> Result<String, WireError> {
        let raw = self.take(len, what)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(WireError::BadUtf8)
    }

    fn finish(self) -> Result<(), WireError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes(self.buf.len()))
        }
    }
}

// ── Payload subcodecs ─────────────────────────────────────────────────────────

/// HELLO payload: status (1B) | version count (1B) | versions (N × 2B).
///
/// Both sides advertise the versions they speak; compatibility requires the
/// intersection to include [`PROTOCOL_VERSION`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloPayload {
    pub status: StatusCode,
    pub versions: Vec<u16>,
}

impl HelloPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.versions.len() * 2);
        buf.put_u8(self.status.into());
        buf.put_u8(self.versions.len() as u8);
        for v in &self.versions {
            buf.put_u16(*v);
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let status = StatusCode::try_from(r.u8("hello status")?)?;
        let count = r.u8("hello version count")? as usize;
        let mut versions = Vec::with_capacity(count);
        for _ in 0..count {
            versions.push(r.u16("hello version")?);
        }
        r.finish()?;
        Ok(Self { status, versions })
    }

    /// True when the advertised set includes the version this build speaks.
    pub fn speaks_current(&self) -> bool {
        self.versions.contains(&PROTOCOL_VERSION)
    }
}

/// STATUS payload: status (1B) | message length (2B) | message (UTF-8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPayload {
    pub status: StatusCode,
    pub message: String,
}

impl StatusPayload {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let msg = self.message.as_bytes();
        let mut buf = BytesMut::with_capacity(3 + msg.len());
        buf.put_u8(self.status.into());
        buf.put_u16(msg.len() as u16);
        buf.put_slice(msg);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let status = StatusCode::try_from(r.u8("status code")?)?;
        let len = r.u16("status message length")? as usize;
        let message = r.text(len, "status message")?;
        r.finish()?;
        Ok(Self { status, message })
    }
}

/// PUT payload: queue (2B len) | content type (2B len) | data (4B len).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutPayload {
    pub queue: String,
    pub content_type: String,
    pub data: Bytes,
}

impl PutPayload {
    pub fn encode(&self) -> Bytes {
        let queue = self.queue.as_bytes();
        let ctype = self.content_type.as_bytes();
        let mut buf = BytesMut::with_capacity(8 + queue.len() + ctype.len() + self.data.len());
        buf.put_u16(queue.len() as u16);
        buf.put_slice(queue);
        buf.put_u16(ctype.len() as u16);
        buf.put_slice(ctype);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let queue_len = r.u16("put queue length")? as usize;
        let queue = r.text(queue_len, "put queue")?;
        let ctype_len = r.u16("put content type length")? as usize;
        let content_type = r.text(ctype_len, "put content type")?;
        let data_len = r.u32("put data length")? as usize;
        let data = Bytes::copy_from_slice(r.take(data_len, "put data")?);
        r.finish()?;
        Ok(Self {
            queue,
            content_type,
            data,
        })
    }
}

/// GET and SEARCH payload: queue path (2B len).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPayload {
    pub queue: String,
}

impl GetPayload {
    pub fn encode(&self) -> Bytes {
        let queue = self.queue.as_bytes();
        let mut buf = BytesMut::with_capacity(2 + queue.len());
        buf.put_u16(queue.len() as u16);
        buf.put_slice(queue);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let queue_len = r.u16("get queue length")? as usize;
        let queue = r.text(queue_len, "get queue")?;
        r.finish()?;
        Ok(Self { queue })
    }
}

/// DELETE payload: queue path (2B len) | object id (16B).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    pub queue: String,
    pub id: Uuid,
}

impl DeletePayload {
    pub fn encode(&self) -> Bytes {
        let queue = self.queue.as_bytes();
        let mut buf = BytesMut::with_capacity(18 + queue.len());
        buf.put_u16(queue.len() as u16);
        buf.put_slice(queue);
        buf.put_slice(self.id.as_bytes());
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let queue_len = r.u16("delete queue length")? as usize;
        let queue = r.text(queue_len, "delete queue")?;
        let id = r.uuid("delete object id")?;
        r.finish()?;
        Ok(Self { queue, id })
    }
}

/// Subject kind flag in LOCATE payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LocateKind {
    Node = 0,
    User = 1,
}

impl TryFrom<u8> for LocateKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LocateKind::Node),
            1 => Ok(LocateKind::User),
            other => Err(WireError::UnknownLocateKind(other)),
        }
    }
}

/// LOCATE payload: subject UUID (16B) | kind flag (1B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatePayload {
    pub subject: Uuid,
    pub kind: LocateKind,
}

impl LocatePayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_slice(self.subject.as_bytes());
        buf.put_u8(self.kind as u8);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let subject = r.uuid("locate subject")?;
        let kind = LocateKind::try_from(r.u8("locate kind")?)?;
        r.finish()?;
        Ok(Self { subject, kind })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("buffer too short: need {need} bytes, got {got}")]
    BufferTooShort { need: usize, got: usize },

    #[error("bad magic byte: 0x{0:02x}")]
    BadMagic(u8),

    #[error("unsupported wire version: {0}")]
    BadVersion(u8),

    #[error("length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unsupported command code: {0}")]
    UnsupportedCommand(u32),

    #[error("unknown status code: {0}")]
    UnknownStatus(u8),

    #[error("unknown locate kind: {0}")]
    UnknownLocateKind(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("truncated payload while reading {0}")]
    TruncatedPayload(&'static str),

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("payload text is not UTF-8: {0}")]
    BadUtf8(std::str::Utf8Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
