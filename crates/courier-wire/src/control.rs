// Payload codec for the server control service.
//
// Subscription requests carry `(service, event, link_id)` as three
// little-endian u32s, in that order, for both register and unregister.
use bytes::{Buf, Bytes, BytesMut};

use crate::{Error, Result};

/// A decoded `RegisterEvent` / `UnregisterEvent` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub service: u32,
    pub event: u32,
    pub link_id: u32,
}

pub fn encode_subscription(service: u32, event: u32, link_id: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    buf.extend_from_slice(&service.to_le_bytes());
    buf.extend_from_slice(&event.to_le_bytes());
    buf.extend_from_slice(&link_id.to_le_bytes());
    buf.freeze()
}

pub fn decode_subscription(mut payload: Bytes) -> Result<Subscription> {
    if payload.remaining() < 12 {
        return Err(Error::MalformedPayload);
    }
    Ok(Subscription {
        service: payload.get_u32_le(),
        event: payload.get_u32_le(),
        link_id: payload.get_u32_le(),
    })
}

/// Reply payload for a `RegisterEvent` call: the broker-side link id.
pub fn encode_link_id(link_id: u32) -> Bytes {
    Bytes::copy_from_slice(&link_id.to_le_bytes())
}

pub fn decode_link_id(mut payload: Bytes) -> Result<u32> {
    if payload.remaining() < 4 {
        return Err(Error::MalformedPayload);
    }
    Ok(payload.get_u32_le())
}

/// Reply payload for an `UnregisterEvent` call.
///
/// The flag is `true` iff the remote link was *not* found. The polarity
/// looks inverted for a success flag but is what peers expect on the wire.
pub fn encode_missing_flag(missing: bool) -> Bytes {
    Bytes::copy_from_slice(&[missing as u8])
}

pub fn decode_missing_flag(payload: Bytes) -> Result<bool> {
    match payload.first() {
        Some(byte) => Ok(*byte != 0),
        None => Err(Error::MalformedPayload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_round_trip() {
        let payload = encode_subscription(3, 5, 17);
        let decoded = decode_subscription(payload).expect("decode");
        assert_eq!(
            decoded,
            Subscription {
                service: 3,
                event: 5,
                link_id: 17
            }
        );
    }

    #[test]
    fn subscription_fields_are_little_endian_in_order() {
        let payload = encode_subscription(1, 2, 3);
        assert_eq!(
            payload.as_ref(),
            &[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]
        );
    }

    #[test]
    fn short_subscription_is_rejected() {
        let err = decode_subscription(Bytes::from_static(&[1, 2, 3])).expect_err("short");
        assert!(matches!(err, Error::MalformedPayload));
    }

    #[test]
    fn missing_flag_round_trip() {
        assert!(decode_missing_flag(encode_missing_flag(true)).expect("decode"));
        assert!(!decode_missing_flag(encode_missing_flag(false)).expect("decode"));
    }

    #[test]
    fn link_id_round_trip() {
        assert_eq!(decode_link_id(encode_link_id(99)).expect("decode"), 99);
    }
}
