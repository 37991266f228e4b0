//! Binary encoding of MQTT-SN messages
//!
//! Every message starts with a length header followed by the type byte. The
//! length covers the whole message including the header. Messages shorter
//! than 256 bytes use a single length octet; longer ones use `0x01` followed by
//! a big-endian 16-bit length.

use super::messages::{
    Connack, Disconnect, Flags, Message, MsgType, Pingreq, Puback, Pubcomp, Publish, Pubrec, Pubrel,
    Regack, Register, ReturnCode,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const LONG_LENGTH_MARKER: u8 = 0x01;
const SHORT_HEADER_LEN: usize = 2;
const LONG_HEADER_LEN: usize = 4;

/// Encoding and decoding failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty datagram")]
    Empty,
    #[error("Message truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("Declared length {declared} does not match datagram length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Topic name or client id is not valid UTF-8")]
    InvalidUtf8,
    #[error("Message type 0x{0:02X} cannot be encoded")]
    NotEncodable(u8),
    #[error("Message of {0} bytes exceeds the maximum length")]
    TooLong(usize),
}

/// Encode a message into a datagram
pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
    let mut body = BytesMut::new();
    match message {
        Message::Connack(msg) => body.put_u8(msg.return_code.into()),
        Message::Register(msg) => {
            body.put_u16(msg.topic_id);
            body.put_u16(msg.msg_id);
            body.put_slice(msg.topic_name.as_bytes());
        }
        Message::Regack(msg) => {
            body.put_u16(msg.topic_id);
            body.put_u16(msg.msg_id);
            body.put_u8(msg.return_code.into());
        }
        Message::Publish(msg) => {
            body.put_u8(msg.flags.to_byte());
            body.put_u16(msg.topic_id);
            body.put_u16(msg.msg_id);
            body.put_slice(&msg.data);
        }
        Message::Puback(msg) => {
            body.put_u16(msg.topic_id);
            body.put_u16(msg.msg_id);
            body.put_u8(msg.return_code.into());
        }
        Message::Pubrec(Pubrec { msg_id })
        | Message::Pubrel(Pubrel { msg_id })
        | Message::Pubcomp(Pubcomp { msg_id }) => body.put_u16(*msg_id),
        Message::Pingreq(msg) => {
            if let Some(client_id) = &msg.client_id {
                body.put_slice(client_id.as_bytes());
            }
        }
        Message::Pingresp => {}
        Message::Disconnect(msg) => {
            if let Some(duration) = msg.duration {
                body.put_u16(duration);
            }
        }
        Message::Other(raw) => return Err(CodecError::NotEncodable(*raw)),
    }

    frame(message.msg_type(), &body)
}

fn frame(msg_type: u8, body: &[u8]) -> Result<Bytes, CodecError> {
    let short_len = SHORT_HEADER_LEN + body.len();
    let mut out = if short_len <= u8::MAX as usize {
        let mut out = BytesMut::with_capacity(short_len);
        out.put_u8(short_len as u8);
        out
    } else {
        let long_len = LONG_HEADER_LEN + body.len();
        if long_len > u16::MAX as usize {
            return Err(CodecError::TooLong(long_len));
        }
        let mut out = BytesMut::with_capacity(long_len);
        out.put_u8(LONG_LENGTH_MARKER);
        out.put_u16(long_len as u16);
        out
    };
    out.put_u8(msg_type);
    out.put_slice(body);
    Ok(out.freeze())
}

/// Decode a single datagram into a message
pub fn decode(datagram: &[u8]) -> Result<Message, CodecError> {
    let mut buf = datagram;
    if buf.is_empty() {
        return Err(CodecError::Empty);
    }

    let declared = if buf[0] == LONG_LENGTH_MARKER {
        ensure(buf, 3)?;
        buf.advance(1);
        buf.get_u16() as usize
    } else {
        buf.get_u8() as usize
    };
    if declared != datagram.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: datagram.len(),
        });
    }

    ensure(buf, 1)?;
    let raw_type = buf.get_u8();
    let Some(msg_type) = MsgType::from_u8(raw_type) else {
        return Ok(Message::Other(raw_type));
    };

    let message = match msg_type {
        MsgType::Connack => {
            ensure(buf, 1)?;
            Message::Connack(Connack {
                return_code: ReturnCode::from(buf.get_u8()),
            })
        }
        MsgType::Register => {
            ensure(buf, 4)?;
            let topic_id = buf.get_u16();
            let msg_id = buf.get_u16();
            Message::Register(Register {
                topic_id,
                msg_id,
                topic_name: read_string(buf)?,
            })
        }
        MsgType::Regack => {
            ensure(buf, 5)?;
            Message::Regack(Regack {
                topic_id: buf.get_u16(),
                msg_id: buf.get_u16(),
                return_code: ReturnCode::from(buf.get_u8()),
            })
        }
        MsgType::Publish => {
            ensure(buf, 5)?;
            let flags = Flags::from_byte(buf.get_u8());
            let topic_id = buf.get_u16();
            let msg_id = buf.get_u16();
            Message::Publish(Publish {
                flags,
                topic_id,
                msg_id,
                data: Bytes::copy_from_slice(buf),
            })
        }
        MsgType::Puback => {
            ensure(buf, 5)?;
            Message::Puback(Puback {
                topic_id: buf.get_u16(),
                msg_id: buf.get_u16(),
                return_code: ReturnCode::from(buf.get_u8()),
            })
        }
        MsgType::Pubrec => {
            ensure(buf, 2)?;
            Message::Pubrec(Pubrec {
                msg_id: buf.get_u16(),
            })
        }
        MsgType::Pubrel => {
            ensure(buf, 2)?;
            Message::Pubrel(Pubrel {
                msg_id: buf.get_u16(),
            })
        }
        MsgType::Pubcomp => {
            ensure(buf, 2)?;
            Message::Pubcomp(Pubcomp {
                msg_id: buf.get_u16(),
            })
        }
        MsgType::Pingreq => {
            let client_id = if buf.is_empty() {
                None
            } else {
                Some(read_string(buf)?)
            };
            Message::Pingreq(Pingreq { client_id })
        }
        MsgType::Pingresp => Message::Pingresp,
        MsgType::Disconnect => {
            let duration = if buf.remaining() >= 2 {
                Some(buf.get_u16())
            } else {
                None
            };
            Message::Disconnect(Disconnect { duration })
        }
        MsgType::Connect => Message::Other(raw_type),
    };

    Ok(message)
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed: needed - buf.remaining(),
        });
    }
    Ok(())
}

fn read_string(buf: &[u8]) -> Result<String, CodecError> {
    std::str::from_utf8(buf)
        .map(str::to_owned)
        .map_err(|_| CodecError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::TopicIdType;

    #[test]
    fn test_encode_pingresp() {
        let bytes = encode(&Message::Pingresp).unwrap();
        assert_eq!(&bytes[..], &[0x02, 0x17]);
    }

    #[test]
    fn test_encode_disconnect_without_duration() {
        let bytes = encode(&Message::Disconnect(Disconnect::default())).unwrap();
        assert_eq!(&bytes[..], &[0x02, 0x18]);
    }

    #[test]
    fn test_encode_connack() {
        let msg = Message::Connack(Connack {
            return_code: ReturnCode::Accepted,
        });
        assert_eq!(&encode(&msg).unwrap()[..], &[0x03, 0x05, 0x00]);
    }

    #[test]
    fn test_connect_decodes_as_other() {
        let decoded = decode(&[0x06, 0x04, 0x04, 0x01, 0x00, 0x3C]).unwrap();
        assert!(decoded.is_connect());
    }

    #[test]
    fn test_encode_pubrel() {
        let bytes = encode(&Message::Pubrel(Pubrel { msg_id: 0x1234 })).unwrap();
        assert_eq!(&bytes[..], &[0x04, 0x10, 0x12, 0x34]);
    }

    #[test]
    fn test_encode_register() {
        let msg = Message::Register(Register {
            topic_id: 1,
            msg_id: 2,
            topic_name: "t2".to_string(),
        });
        let bytes = encode(&msg).unwrap();
        assert_eq!(&bytes[..], &[0x08, 0x0A, 0x00, 0x01, 0x00, 0x02, b't', b'2']);
    }

    #[test]
    fn test_long_frame_uses_three_byte_length() {
        let msg = Message::Publish(Publish {
            flags: Flags {
                topic_id_type: TopicIdType::Normal,
                ..Default::default()
            },
            topic_id: 7,
            msg_id: 9,
            data: Bytes::from(vec![0xAB; 300]),
        });
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes[0], LONG_LENGTH_MARKER);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]) as usize, bytes.len());
        assert_eq!(bytes[3], 0x0C);
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let result = decode(&[0x05, 0x17]);
        assert_eq!(
            result,
            Err(CodecError::LengthMismatch {
                declared: 5,
                actual: 2
            })
        );
    }

    #[test]
    fn test_decode_rejects_truncated_regack() {
        let result = decode(&[0x04, 0x0B, 0x00, 0x01]);
        assert!(matches!(result, Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(decode(&[]), Err(CodecError::Empty));
    }

    #[test]
    fn test_decode_unknown_type_is_other() {
        // SUBSCRIBE
        assert_eq!(decode(&[0x02, 0x12]).unwrap(), Message::Other(0x12));
    }

    #[test]
    fn test_other_is_not_encodable() {
        assert_eq!(
            encode(&Message::Other(0x12)),
            Err(CodecError::NotEncodable(0x12))
        );
    }

    #[test]
    fn test_decode_pingreq_with_client_id() {
        let decoded = decode(&[0x06, 0x16, b'n', b'o', b'd', b'e']).unwrap();
        assert_eq!(
            decoded,
            Message::Pingreq(Pingreq {
                client_id: Some("node".to_string())
            })
        );
    }

    #[test]
    fn test_decode_sleep_disconnect() {
        let decoded = decode(&[0x04, 0x18, 0x00, 0x3C]).unwrap();
        assert_eq!(
            decoded,
            Message::Disconnect(Disconnect { duration: Some(60) })
        );
    }

    #[test]
    fn test_decode_invalid_utf8_topic() {
        let result = decode(&[0x07, 0x0A, 0x00, 0x01, 0x00, 0x02, 0xFF]);
        assert_eq!(result, Err(CodecError::InvalidUtf8));
    }
}
