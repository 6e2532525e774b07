//! Length-prefixed request/response/notify framing.
//!
//! Every frame starts with a fixed 33-byte header (little-endian):
//!
//! ```text
//! magic               u64   0x0101010101012101
//! cb                  u64   body length
//! have_to_return_data u8    responder must send a response frame
//! command             u32
//! return_code         i32   meaningful in responses only
//! flags               u32   bit0 request, bit1 response,
//!                           bit2 start-fragment, bit3 end-fragment,
//!                           bits 16..32 request ticket
//! protocol_version    u32
//! ```
//!
//! The body is an opaque byte string; its encoding is the application's
//! business. Responses are matched to requests by the connection-local
//! ticket carried in the upper half of the flags word, so concurrent
//! invokes on one connection each await their own ticket.

use crate::error::NetError;
use crate::net::types::{MAX_FRAME_SIZE, NETWORK_MAGIC, WIRE_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const FLAG_REQUEST: u32 = 1 << 0;
pub const FLAG_RESPONSE: u32 = 1 << 1;
pub const FLAG_START_FRAGMENT: u32 = 1 << 2;
pub const FLAG_END_FRAGMENT: u32 = 1 << 3;

const TICKET_SHIFT: u32 = 16;

/// Fixed frame header size on the wire.
pub const HEADER_SIZE: usize = 8 + 8 + 1 + 4 + 4 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u64,
    pub expect_response: bool,
    pub command: u32,
    pub return_code: i32,
    pub flags: u32,
    pub version: u32,
}

impl FrameHeader {
    pub fn is_request(&self) -> bool {
        self.flags & FLAG_REQUEST != 0
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    /// Connection-local request counter, from the upper flag bits.
    pub fn ticket(&self) -> u16 {
        (self.flags >> TICKET_SHIFT) as u16
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl Frame {
    pub fn request(command: u32, ticket: u16, body: Bytes) -> Self {
        Self {
            header: FrameHeader {
                length: body.len() as u64,
                expect_response: true,
                command,
                return_code: 0,
                flags: FLAG_REQUEST | ((ticket as u32) << TICKET_SHIFT),
                version: WIRE_VERSION,
            },
            body,
        }
    }

    pub fn response(command: u32, ticket: u16, return_code: i32, body: Bytes) -> Self {
        Self {
            header: FrameHeader {
                length: body.len() as u64,
                expect_response: false,
                command,
                return_code,
                flags: FLAG_RESPONSE | ((ticket as u32) << TICKET_SHIFT),
                version: WIRE_VERSION,
            },
            body,
        }
    }

    /// Fire-and-forget frame; no response expected or matched.
    pub fn notify(command: u32, body: Bytes) -> Self {
        Self {
            header: FrameHeader {
                length: body.len() as u64,
                expect_response: false,
                command,
                return_code: 0,
                flags: FLAG_REQUEST,
                version: WIRE_VERSION,
            },
            body,
        }
    }

    /// Bytes occupied on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }
}

/// Frame codec for `FramedRead`/`FramedWrite`.
#[derive(Debug, Default)]
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, NetError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut peek = &src[..HEADER_SIZE];
        let magic = peek.get_u64_le();
        if magic != NETWORK_MAGIC {
            return Err(NetError::Protocol(format!("bad magic {magic:#018x}")));
        }
        let length = peek.get_u64_le();
        if length as usize > MAX_FRAME_SIZE {
            return Err(NetError::Protocol(format!("oversized frame: {length} bytes")));
        }
        let total = HEADER_SIZE + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let expect_response = peek.get_u8() != 0;
        let command = peek.get_u32_le();
        let return_code = peek.get_i32_le();
        let flags = peek.get_u32_le();
        let version = peek.get_u32_le();
        if version != WIRE_VERSION {
            return Err(NetError::Protocol(format!("unsupported wire version {version}")));
        }

        src.advance(HEADER_SIZE);
        let body = src.split_to(length as usize).freeze();
        Ok(Some(Frame {
            header: FrameHeader {
                length,
                expect_response,
                command,
                return_code,
                flags,
                version,
            },
            body,
        }))
    }
}

impl Encoder<Frame> for WireCodec {
    type Error = NetError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), NetError> {
        dst.reserve(HEADER_SIZE + frame.body.len());
        dst.put_u64_le(NETWORK_MAGIC);
        dst.put_u64_le(frame.body.len() as u64);
        dst.put_u8(frame.header.expect_response as u8);
        dst.put_u32_le(frame.header.command);
        dst.put_i32_le(frame.header.return_code);
        dst.put_u32_le(frame.header.flags);
        dst.put_u32_le(frame.header.version);
        dst.put_slice(&frame.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn request_roundtrip() {
        let out = roundtrip(Frame::request(1001, 7, Bytes::from_static(b"hello")));
        assert!(out.header.is_request());
        assert!(!out.header.is_response());
        assert!(out.header.expect_response);
        assert_eq!(out.header.command, 1001);
        assert_eq!(out.header.ticket(), 7);
        assert_eq!(&out.body[..], b"hello");
    }

    #[test]
    fn response_carries_return_code_and_ticket() {
        let out = roundtrip(Frame::response(1002, 65535, -2, Bytes::new()));
        assert!(out.header.is_response());
        assert_eq!(out.header.return_code, -2);
        assert_eq!(out.header.ticket(), 65535);
    }

    #[test]
    fn partial_header_yields_none() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::notify(1008, Bytes::from_static(b"x")), &mut buf).unwrap();
        let mut partial = BytesMut::from(&buf[..HEADER_SIZE - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn partial_body_yields_none() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::notify(1008, Bytes::from_static(b"abcdef")), &mut buf).unwrap();
        let mut partial = BytesMut::from(&buf[..buf.len() - 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn bad_magic_is_protocol_error() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::notify(1008, Bytes::new()), &mut buf).unwrap();
        buf[0] ^= 0xff;
        assert!(matches!(codec.decode(&mut buf), Err(NetError::Protocol(_))));
    }

    #[test]
    fn oversized_length_rejected_before_body() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        buf.put_u64_le(NETWORK_MAGIC);
        buf.put_u64_le(MAX_FRAME_SIZE as u64 + 1);
        buf.put_bytes(0, HEADER_SIZE - 16);
        assert!(matches!(codec.decode(&mut buf), Err(NetError::Protocol(_))));
    }
}
