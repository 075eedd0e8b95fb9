// Wire format for courier frames: a fixed little-endian header followed by
// an opaque payload.
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub mod control;
pub mod fault;

pub const MAGIC: u32 = 0x434F5552;
pub const VERSION: u16 = 1;

/// Reserved service id for the in-band server control service.
pub const SERVICE_SERVER: u32 = 0;
/// The only subpath used by the core.
pub const PATH_MAIN: u32 = 1;
/// Control-service function: subscribe a remote link to an event.
pub const SERVER_REGISTER_EVENT: u32 = 0;
/// Control-service function: drop a remote link.
pub const SERVER_UNREGISTER_EVENT: u32 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("malformed payload")]
    MalformedPayload,
}

/// Frame kind carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Call = 1,
    Reply = 2,
    Error = 3,
    Event = 4,
}

impl Kind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Kind::Call),
            2 => Some(Kind::Reply),
            3 => Some(Kind::Error),
            4 => Some(Kind::Event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u32,
    pub kind: Kind,
    pub service: u32,
    pub path: u32,
    pub function: u32,
    pub length: u32,
}

impl Header {
    pub const LEN: usize = 27;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.put_u8(self.kind as u8);
        buf.extend_from_slice(&self.service.to_le_bytes());
        buf.extend_from_slice(&self.path.to_le_bytes());
        buf.extend_from_slice(&self.function.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
    }

    pub fn encode_into(&self, out: &mut [u8; Self::LEN]) {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        self.encode(&mut buf);
        out.copy_from_slice(&buf);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate magic and version before trusting any other field.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32_le();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16_le();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let id = buf.get_u32_le();
        let kind = buf.get_u8();
        let kind = Kind::from_u8(kind).ok_or(Error::UnknownKind(kind))?;
        let service = buf.get_u32_le();
        let path = buf.get_u32_le();
        let function = buf.get_u32_le();
        let length = buf.get_u32_le();
        Ok(Self {
            id,
            kind,
            service,
            path,
            function,
            length,
        })
    }
}

/// One framed message.
///
/// ```
/// use bytes::Bytes;
/// use courier_wire::{Kind, Message};
///
/// let msg = Message::new(7, Kind::Call, 3, 9, Bytes::from_static(b"hi"));
/// let decoded = Message::decode(msg.encode()).expect("decode");
/// assert_eq!(decoded, msg);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u32,
    pub kind: Kind,
    pub service: u32,
    pub path: u32,
    pub function: u32,
    pub payload: Bytes,
}

impl Message {
    pub fn new(id: u32, kind: Kind, service: u32, function: u32, payload: Bytes) -> Self {
        Self {
            id,
            kind,
            service,
            path: PATH_MAIN,
            function,
            payload,
        }
    }

    /// Build a reply envelope: same id, service, path, function as the
    /// request, kind set to `Reply`.
    pub fn reply_to(request: &Message, payload: Bytes) -> Self {
        Self {
            id: request.id,
            kind: Kind::Reply,
            service: request.service,
            path: request.path,
            function: request.function,
            payload,
        }
    }

    /// Build an error reply carrying a plain-text fault payload.
    pub fn error_reply_to(request: &Message, text: &str) -> Self {
        Self {
            kind: Kind::Error,
            payload: fault::encode(fault::PLAIN_SIGNATURE, text.as_bytes()),
            ..Self::reply_to(request, Bytes::new())
        }
    }

    pub fn header(&self) -> Header {
        Header {
            id: self.id,
            kind: self.kind,
            service: self.service,
            path: self.path,
            function: self.function,
            length: self.payload.len() as u32,
        }
    }

    pub fn from_parts(header: Header, payload: Bytes) -> Self {
        Self {
            id: header.id,
            kind: header.kind,
            service: header.service,
            path: header.path,
            function: header.function,
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        // Pre-allocate the exact frame size to avoid reallocation.
        let mut buf = BytesMut::with_capacity(Header::LEN + self.payload.len());
        self.header().encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        if input.len() < Header::LEN {
            return Err(Error::Incomplete);
        }
        let header = Header::decode(input.slice(0..Header::LEN))?;
        let length = header.length as usize;
        if input.len() < Header::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(Header::LEN..Header::LEN + length);
        Ok(Self::from_parts(header, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_fields() {
        let msg = Message::new(42, Kind::Event, 5, 11, Bytes::from_static(b"payload"));
        let decoded = Message::decode(msg.encode()).expect("decode");
        assert_eq!(decoded, msg);
        assert_eq!(decoded.path, PATH_MAIN);
    }

    #[test]
    fn reply_echoes_request_envelope() {
        let request = Message::new(9, Kind::Call, 2, 7, Bytes::from_static(b"in"));
        let reply = Message::reply_to(&request, Bytes::from_static(b"out"));
        assert_eq!(reply.id, 9);
        assert_eq!(reply.service, 2);
        assert_eq!(reply.function, 7);
        assert_eq!(reply.kind, Kind::Reply);
    }

    #[test]
    fn error_reply_carries_plain_fault() {
        let request = Message::new(3, Kind::Call, 2, 7, Bytes::new());
        let reply = Message::error_reply_to(&request, "Service not found");
        assert_eq!(reply.kind, Kind::Error);
        let (signature, details) = fault::decode(reply.payload).expect("fault");
        assert_eq!(signature, fault::PLAIN_SIGNATURE);
        assert_eq!(details.as_ref(), b"Service not found");
    }

    #[test]
    fn decode_rejects_invalid_magic() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        buf.extend_from_slice(&[0u8; Header::LEN - 4]);
        let err = Header::decode(buf.freeze()).expect_err("invalid magic");
        assert!(matches!(err, Error::InvalidMagic));
    }

    #[test]
    fn decode_rejects_unsupported_version() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&0xFFFFu16.to_le_bytes());
        buf.extend_from_slice(&[0u8; Header::LEN - 6]);
        let err = Header::decode(buf.freeze()).expect_err("unsupported version");
        assert!(matches!(err, Error::UnsupportedVersion(0xFFFF)));
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let msg = Message::new(1, Kind::Call, 0, 0, Bytes::new());
        let mut bytes = BytesMut::from(msg.encode().as_ref());
        bytes[10] = 0x7F;
        let err = Message::decode(bytes.freeze()).expect_err("unknown kind");
        assert!(matches!(err, Error::UnknownKind(0x7F)));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let msg = Message::new(1, Kind::Call, 0, 0, Bytes::from_static(b"hello"));
        let encoded = msg.encode();
        let err = Message::decode(encoded.slice(0..encoded.len() - 2)).expect_err("truncated");
        assert!(matches!(err, Error::Incomplete));
    }
}
