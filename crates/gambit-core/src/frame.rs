//! WebSocket frame codec (RFC 6455 Section 5).
//!
//! One [`Frame`] models exactly one wire message; fragment reassembly
//! across frames is out of scope for the relay. The codec plugs into
//! `tokio_util`'s [`FramedRead`]/[`FramedWrite`] halves via the
//! [`Decoder`] and [`Encoder`] traits.
//!
//! [`FramedRead`]: tokio_util::codec::FramedRead
//! [`FramedWrite`]: tokio_util::codec::FramedWrite

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frame kind, from the 4-bit opcode nibble.
///
/// The mapping is total: nibbles outside the assigned set decode to
/// [`Opcode::Unknown`] so dispatch can answer them with a protocol-error
/// close instead of the decoder guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuation of a fragmented message (0x0).
    Continuation,
    /// UTF-8 text data (0x1).
    Text,
    /// Binary data (0x2).
    Binary,
    /// Connection close control frame (0x8).
    Close,
    /// Ping control frame (0x9).
    Ping,
    /// Pong control frame (0xA).
    Pong,
    /// Any opcode nibble without an assigned meaning.
    Unknown(u8),
}

impl Opcode {
    /// Map an opcode nibble to its kind. Total; never fails.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Unknown(other),
        }
    }

    /// The wire nibble for this kind.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Unknown(code) => code & 0x0F,
        }
    }

    /// Human-readable label, used in logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Continuation => "continuation",
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Close status codes the relay sends (IANA-assigned, RFC 6455 Section 7.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Endpoint is going away, e.g. server shutdown (1001).
    GoingAway = 1001,
    /// Protocol error (1002).
    ProtocolError = 1002,
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code as Self
    }
}

/// A decoded WebSocket frame.
///
/// Immutable once constructed. Server-originated frames carry no masking
/// key; constructing a frame with [`Frame::masked`] produces the
/// client-direction form (the encoder then emits the key and XORs the
/// payload onto the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final-fragment flag. Always set on outgoing frames.
    pub fin: bool,
    /// Reserved bit 1 as seen on the wire. Never set on encode.
    pub rsv1: bool,
    /// Reserved bit 2 as seen on the wire. Never set on encode.
    pub rsv2: bool,
    /// Reserved bit 3 as seen on the wire. Never set on encode.
    pub rsv3: bool,
    /// Frame kind.
    pub opcode: Opcode,
    /// Masking key, present on client-originated frames.
    pub mask_key: Option<[u8; 4]>,
    /// Unmasked payload bytes.
    pub payload: Bytes,
}

impl Frame {
    fn data(opcode: Opcode, payload: Bytes) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask_key: None,
            payload,
        }
    }

    /// A final text frame with the given payload.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Text, payload.into())
    }

    /// A final binary frame with the given payload.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Binary, payload.into())
    }

    /// A ping control frame with no payload.
    #[must_use]
    pub fn ping() -> Self {
        Self::data(Opcode::Ping, Bytes::new())
    }

    /// A pong control frame with no payload.
    #[must_use]
    pub fn pong() -> Self {
        Self::data(Opcode::Pong, Bytes::new())
    }

    /// A close frame: 2-byte big-endian status code, then the optional
    /// UTF-8 reason.
    #[must_use]
    pub fn close(code: CloseCode, reason: Option<&str>) -> Self {
        let reason = reason.unwrap_or_default();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(u16::from(code));
        payload.put_slice(reason.as_bytes());
        Self::data(Opcode::Close, payload.freeze())
    }

    /// Attach a masking key, turning this into a client-direction frame.
    #[must_use]
    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask_key = Some(key);
        self
    }

    /// The status code carried by a close frame, if the payload holds one.
    #[must_use]
    pub fn close_status(&self) -> Option<u16> {
        if self.payload.len() >= 2 {
            Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
        } else {
            None
        }
    }
}

/// XOR a payload with a 4-byte masking key, in place.
///
/// Masking is an involution: applying the same key twice restores the
/// original bytes, so this serves both encode and decode.
pub fn toggle_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Frame codec errors. All of them are fatal to the connection that
/// produced the bytes; the session answers with a protocol-error close
/// where the stream is still writable and tears down.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Transport failure while reading or writing frame bytes.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Declared payload length exceeds the configured cap.
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        /// Declared payload length.
        size: u64,
        /// Configured maximum.
        max: usize,
    },
}

/// Stateless-per-frame WebSocket codec.
///
/// Decoding peeks at the buffer until a complete frame is available, so
/// partially received frames keep their bytes buffered and yield `None`.
/// A stream that ends mid-frame surfaces as an I/O decode error from the
/// framing layer, which the session treats as connection-fatal.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    /// Default payload cap, matching the relay's message size limit.
    pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

    /// Codec with the default payload cap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_payload: Self::DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Codec with an explicit payload cap.
    #[must_use]
    pub fn with_limit(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];
        let masked = second & 0x80 != 0;

        // Three-tier length: 7-bit inline, 16-bit extended, 64-bit extended.
        let (payload_len, ext_len) = match second & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 2)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut be = [0u8; 8];
                be.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(be), 8)
            }
            inline => (u64::from(inline), 0),
        };

        if payload_len > self.max_payload as u64 {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload,
            });
        }

        let header_len = 2 + ext_len + if masked { 4 } else { 0 };
        let total_len = header_len + payload_len as usize;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(2 + ext_len);
        let mask_key = if masked {
            let key = src.split_to(4);
            Some([key[0], key[1], key[2], key[3]])
        } else {
            None
        };

        let mut payload = src.split_to(payload_len as usize);
        if let Some(key) = mask_key {
            toggle_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin: first & 0x80 != 0,
            rsv1: first & 0x40 != 0,
            rsv2: first & 0x20 != 0,
            rsv3: first & 0x10 != 0,
            opcode: Opcode::from_code(first & 0x0F),
            mask_key,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = frame.payload.len();

        // FIN is always set: the relay never fragments outgoing messages.
        // Reserved bits go out as zero regardless of what was decoded.
        let first = 0x80 | frame.opcode.code();
        let mask_bit: u8 = if frame.mask_key.is_some() { 0x80 } else { 0 };

        let ext_len = if len > 65535 {
            8
        } else if len > 125 {
            2
        } else {
            0
        };
        dst.reserve(2 + ext_len + if frame.mask_key.is_some() { 4 } else { 0 } + len);

        dst.put_u8(first);
        if len > 65535 {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        } else if len > 125 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | len as u8);
        }

        match frame.mask_key {
            Some(key) => {
                dst.put_slice(&key);
                let mut masked = frame.payload.to_vec();
                toggle_mask(&mut masked, key);
                dst.put_slice(&masked);
            }
            None => dst.put_slice(&frame.payload),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn round_trip(frame: Frame) -> Frame {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty(), "decoder must consume the whole frame");
        decoded
    }

    #[test]
    fn opcode_mapping_is_total() {
        for code in 0u8..=0x0F {
            let opcode = Opcode::from_code(code);
            match code {
                0x0 => assert_eq!(opcode, Opcode::Continuation),
                0x1 => assert_eq!(opcode, Opcode::Text),
                0x2 => assert_eq!(opcode, Opcode::Binary),
                0x8 => assert_eq!(opcode, Opcode::Close),
                0x9 => assert_eq!(opcode, Opcode::Ping),
                0xA => assert_eq!(opcode, Opcode::Pong),
                other => assert_eq!(opcode, Opcode::Unknown(other)),
            }
            assert_eq!(opcode.code(), code);
        }
    }

    #[test]
    fn opcode_labels() {
        assert_eq!(Opcode::Text.label(), "text");
        assert_eq!(Opcode::Close.label(), "close");
        assert_eq!(Opcode::Unknown(0x5).label(), "unknown");
        assert_eq!(Opcode::Pong.to_string(), "pong");
    }

    #[test]
    fn round_trip_boundary_lengths() {
        // Covers every length-field tier, 64-bit extended included.
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let payload = vec![0xA5u8; len];
            let decoded = round_trip(Frame::text(payload.clone()));
            assert_eq!(decoded.opcode, Opcode::Text, "len {len}");
            assert_eq!(decoded.payload.as_ref(), &payload[..], "len {len}");
            assert!(decoded.fin);
        }
    }

    #[test]
    fn sixteen_bit_length_wire_format() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::text(vec![0u8; 300]), &mut buf).unwrap();
        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 126);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 300);
        assert_eq!(buf.len(), 4 + 300);
    }

    #[test]
    fn sixty_four_bit_length_wire_format() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::binary(vec![7u8; 65536]), &mut buf)
            .unwrap();
        assert_eq!(buf[0], 0x82);
        assert_eq!(buf[1], 127);
        let mut be = [0u8; 8];
        be.copy_from_slice(&buf[2..10]);
        assert_eq!(u64::from_be_bytes(be), 65536);
        assert_eq!(buf.len(), 10 + 65536);
    }

    #[test]
    fn masked_wire_bytes_are_xored() {
        let key = [0x37, 0xFA, 0x21, 0x3D];
        let payload = b"Hello".to_vec();

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::text(payload.clone()).masked(key), &mut buf)
            .unwrap();

        // Header: 2 bytes, then the 4-byte key, then the masked payload.
        assert_eq!(buf[1] & 0x80, 0x80, "mask bit must be set");
        assert_eq!(&buf[2..6], &key);
        for (i, &byte) in buf[6..].iter().enumerate() {
            assert_eq!(byte, payload[i] ^ key[i % 4]);
        }

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.mask_key, Some(key));
        assert_eq!(decoded.payload.as_ref(), b"Hello");
    }

    #[test]
    fn server_frames_are_never_masked() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::text("e2e4:black"), &mut buf).unwrap();
        assert_eq!(buf[1] & 0x80, 0, "server frames carry no mask bit");
        assert_eq!(&buf[2..], b"e2e4:black");
    }

    #[test]
    fn toggle_mask_is_an_involution() {
        let key = [1, 2, 3, 4];
        let mut bytes = b"queen takes knight".to_vec();
        let original = bytes.clone();
        toggle_mask(&mut bytes, key);
        assert_ne!(bytes, original);
        toggle_mask(&mut bytes, key);
        assert_eq!(bytes, original);
    }

    #[test]
    fn empty_payload_encodes_to_two_bytes() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::pong(), &mut buf).unwrap();
        assert_eq!(buf.as_ref(), &[0x8A, 0x00]);
    }

    #[test]
    fn unknown_opcode_still_decodes_structurally() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x83u8, 0x02, 0xAB, 0xCD][..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Unknown(0x3));
        assert_eq!(frame.payload.as_ref(), &[0xAB, 0xCD]);
    }

    #[test]
    fn partial_input_returns_none_and_keeps_bytes() {
        let mut codec = FrameCodec::new();
        let mut full = BytesMut::new();
        codec.encode(Frame::text("e7e5"), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 3, "undecoded bytes stay buffered");

        partial.extend_from_slice(&full[3..]);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"e7e5");
    }

    #[test]
    fn two_frames_in_one_buffer_decode_in_order() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::text("first"), &mut buf).unwrap();
        codec.encode(Frame::text("second"), &mut buf).unwrap();

        let one = codec.decode(&mut buf).unwrap().unwrap();
        let two = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(one.payload.as_ref(), b"first");
        assert_eq!(two.payload.as_ref(), b"second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut codec = FrameCodec::with_limit(16);
        let mut buf = BytesMut::from(&[0x81u8, 100][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_matches!(err, FrameError::PayloadTooLarge { size: 100, max: 16 });
    }

    #[test]
    fn close_frame_payload_layout() {
        let frame = Frame::close(CloseCode::Normal, Some("bye"));
        assert_eq!(frame.opcode, Opcode::Close);
        assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&frame.payload[2..], b"bye");
        assert_eq!(frame.close_status(), Some(1000));
    }

    #[test]
    fn close_frame_without_reason_is_code_only() {
        let frame = Frame::close(CloseCode::ProtocolError, None);
        assert_eq!(frame.payload.len(), 2);
        assert_eq!(frame.close_status(), Some(1002));
    }

    #[test]
    fn close_status_on_short_payload_is_none() {
        let frame = Frame::data(Opcode::Close, Bytes::new());
        assert_eq!(frame.close_status(), None);
    }

    #[test]
    fn close_code_values() {
        assert_eq!(u16::from(CloseCode::Normal), 1000);
        assert_eq!(u16::from(CloseCode::GoingAway), 1001);
        assert_eq!(u16::from(CloseCode::ProtocolError), 1002);
    }

    #[test]
    fn reserved_bits_are_decoded_but_not_echoed() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0xF1u8, 0x00][..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.rsv1 && frame.rsv2 && frame.rsv3);

        let mut out = BytesMut::new();
        codec.encode(frame, &mut out).unwrap();
        assert_eq!(out[0] & 0x70, 0, "reserved bits go out as zero");
    }
}
