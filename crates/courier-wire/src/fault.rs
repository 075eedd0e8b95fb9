// Payload codec for `Error` frames: a signature string followed by opaque
// details, both length-prefixed.
use bytes::{Buf, Bytes, BytesMut};

use crate::{Error, Result};

/// Signature used when the details buffer is a plain human-readable string.
pub const PLAIN_SIGNATURE: &str = "s";

pub fn encode(signature: &str, details: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + signature.len() + details.len());
    buf.extend_from_slice(&(signature.len() as u32).to_le_bytes());
    buf.extend_from_slice(signature.as_bytes());
    buf.extend_from_slice(&(details.len() as u32).to_le_bytes());
    buf.extend_from_slice(details);
    buf.freeze()
}

pub fn decode(mut payload: Bytes) -> Result<(String, Bytes)> {
    if payload.remaining() < 4 {
        return Err(Error::MalformedPayload);
    }
    let signature_len = payload.get_u32_le() as usize;
    if payload.remaining() < signature_len {
        return Err(Error::MalformedPayload);
    }
    let signature = String::from_utf8(payload.split_to(signature_len).to_vec())
        .map_err(|_| Error::MalformedPayload)?;
    if payload.remaining() < 4 {
        return Err(Error::MalformedPayload);
    }
    let details_len = payload.get_u32_le() as usize;
    if payload.remaining() < details_len {
        return Err(Error::MalformedPayload);
    }
    let details = payload.split_to(details_len);
    Ok((signature, details))
}
