/// SiriDB packet framing
///
/// Every packet is an 8 byte little-endian header followed by a qpack body:
///
///   u32 body length | u16 packet id | u8 type | u8 check (type ^ 0xff)
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::core::backend::BackendError;
use crate::siridb::qpack;

pub const HEADER_SIZE: usize = 8;

/// Packets larger than this are treated as a corrupt stream
pub const MAX_BODY_SIZE: usize = 512 * 1024 * 1024;

pub mod request {
    pub const QUERY: u8 = 0;
    pub const INSERT: u8 = 1;
    pub const AUTH: u8 = 2;
    pub const PING: u8 = 3;
}

pub mod response {
    pub const QUERY: u8 = 0;
    pub const INSERT: u8 = 1;
    pub const AUTH_SUCCESS: u8 = 2;
    pub const ACK: u8 = 3;

    pub const ERR_MSG: u8 = 64;
    pub const ERR_QUERY: u8 = 65;
    pub const ERR_INSERT: u8 = 66;
    pub const ERR_SERVER: u8 = 67;
    pub const ERR_POOL: u8 = 68;
    pub const ERR_USER_ACCESS: u8 = 69;
    pub const ERR: u8 = 70;
    pub const ERR_NOT_AUTHENTICATED: u8 = 71;
    pub const ERR_AUTH_CREDENTIALS: u8 = 72;
    pub const ERR_AUTH_UNKNOWN_DB: u8 = 73;
    pub const ERR_LOADING_DB: u8 = 74;
}

/// Framing errors; any of these ends the connection
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid check bit for packet type {tp}: {check}")]
    InvalidCheck { tp: u8, check: u8 },
    #[error("packet body of {0} bytes exceeds the maximum size")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub pid: u16,
    pub tp: u8,
    pub body: Bytes,
}

impl Packet {
    pub fn new(pid: u16, tp: u8, body: impl Into<Bytes>) -> Self {
        Self {
            pid,
            tp,
            body: body.into(),
        }
    }

    /// Packet with a qpack encoded body
    pub fn with_value(pid: u16, tp: u8, value: &Value) -> Self {
        Self::new(pid, tp, qpack::pack(value).freeze())
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE + self.body.len());
        buf.put_u32_le(self.body.len() as u32);
        buf.put_u16_le(self.pid);
        buf.put_u8(self.tp);
        buf.put_u8(self.tp ^ 0xff);
        buf.put_slice(&self.body);
    }

    /// Parse one packet; `Ok(None)` when more bytes are needed
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Packet>, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let tp = buf[6];
        let check = buf[7];
        if tp ^ 0xff != check {
            return Err(FrameError::InvalidCheck { tp, check });
        }
        if len > MAX_BODY_SIZE {
            return Err(FrameError::TooLarge(len));
        }
        if buf.len() < HEADER_SIZE + len {
            buf.reserve(HEADER_SIZE + len - buf.len());
            return Ok(None);
        }

        let mut header = buf.split_to(HEADER_SIZE);
        header.advance(4);
        let pid = header.get_u16_le();
        let body = buf.split_to(len).freeze();
        Ok(Some(Packet { pid, tp, body }))
    }

    /// Interpret a response packet
    pub fn into_result(self) -> Result<Value, BackendError> {
        match self.tp {
            response::QUERY | response::INSERT => self.decode_body(),
            response::AUTH_SUCCESS | response::ACK => Ok(Value::Null),
            tp => {
                let msg = self.error_msg();
                Err(match tp {
                    response::ERR_QUERY => BackendError::Query(msg),
                    response::ERR_INSERT => BackendError::Insert(msg),
                    response::ERR_SERVER => BackendError::Server(msg),
                    response::ERR_POOL => BackendError::Pool(msg),
                    response::ERR_USER_ACCESS => BackendError::UserAccess(msg),
                    response::ERR_NOT_AUTHENTICATED
                    | response::ERR_AUTH_CREDENTIALS
                    | response::ERR_AUTH_UNKNOWN_DB => BackendError::Auth(msg),
                    response::ERR_LOADING_DB => BackendError::Server(msg),
                    response::ERR_MSG | response::ERR => BackendError::Server(msg),
                    other => BackendError::Protocol(format!("unexpected packet type {other}")),
                })
            }
        }
    }

    fn decode_body(&self) -> Result<Value, BackendError> {
        if self.body.is_empty() {
            return Ok(Value::Null);
        }
        qpack::unpack(&self.body).map_err(|e| BackendError::Protocol(e.to_string()))
    }

    fn error_msg(&self) -> String {
        self.decode_body()
            .ok()
            .and_then(|body| body.get("error_msg").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| format!("SiriDB error (packet type {})", self.tp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_layout() {
        let packet = Packet::new(0x0102, request::AUTH, Bytes::from_static(b"\xed"));
        let mut buf = BytesMut::new();
        packet.encode_into(&mut buf);
        assert_eq!(&buf[..], &[1, 0, 0, 0, 0x02, 0x01, 2, 0xfd, 0xed]);
    }

    #[test]
    fn test_parse_waits_for_full_packet() {
        let packet = Packet::with_value(7, response::QUERY, &json!({"data": [1, 2, 3]}));
        let mut encoded = BytesMut::new();
        packet.encode_into(&mut encoded);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..5]);
        assert!(Packet::parse(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[5..encoded.len() - 1]);
        assert!(Packet::parse(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[encoded.len() - 1..]);

        let parsed = Packet::parse(&mut buf).unwrap().unwrap();
        assert_eq!(parsed, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_two_packets_in_one_read() {
        let mut buf = BytesMut::new();
        Packet::new(1, response::ACK, Bytes::new()).encode_into(&mut buf);
        Packet::new(2, response::AUTH_SUCCESS, Bytes::new()).encode_into(&mut buf);

        assert_eq!(Packet::parse(&mut buf).unwrap().unwrap().pid, 1);
        assert_eq!(Packet::parse(&mut buf).unwrap().unwrap().pid, 2);
        assert!(Packet::parse(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_bad_check_bit() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0, 1, 0, 3, 3][..]);
        assert!(matches!(
            Packet::parse(&mut buf),
            Err(FrameError::InvalidCheck { tp: 3, check: 3 })
        ));
    }

    #[test]
    fn test_error_responses() {
        let err = Packet::with_value(
            1,
            response::ERR_QUERY,
            &json!({"error_msg": "Query error at position 7"}),
        )
        .into_result()
        .unwrap_err();
        assert_eq!(err, BackendError::Query("Query error at position 7".to_string()));

        let err = Packet::with_value(
            1,
            response::ERR_AUTH_CREDENTIALS,
            &json!({"error_msg": "invalid username or password"}),
        )
        .into_result()
        .unwrap_err();
        assert!(matches!(err, BackendError::Auth(_)));

        let err = Packet::new(1, response::ERR_POOL, Bytes::new())
            .into_result()
            .unwrap_err();
        assert!(matches!(err, BackendError::Pool(msg) if msg.contains("68")));
    }

    #[test]
    fn test_query_response_body() {
        let value = json!({"series": ["cpu", "mem"]});
        let result = Packet::with_value(3, response::QUERY, &value)
            .into_result()
            .unwrap();
        assert_eq!(result, value);
    }
}
