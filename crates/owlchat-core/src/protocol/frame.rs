//! Frame codec: the outermost transport envelope
//!
//! Every byte on a service connection belongs to a frame:
//!
//! ```text
//! +--------+---------+----------+-------------+---------------+
//! | 0x2a   | channel | sequence | payload len | payload ...   |
//! | 1 byte | 1 byte  | u16 BE   | u16 BE      | len bytes     |
//! +--------+---------+----------+-------------+---------------+
//! ```
//!
//! Decoding is resumable: a partial frame yields [`FrameError::NeedMoreData`]
//! and consumes nothing, so a non-blocking reader can keep the buffered bytes
//! and retry once more arrive.

use core::fmt;

use crate::errors::{OwlchatError, ProtocolViolation, Result};
use crate::protocol::bytes::{ByteReader, WireWrite};
use crate::protocol::tlv::{Tlv, TlvChain};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// First byte of every frame
pub const FRAME_MARKER: u8 = 0x2a;

/// Size of the fixed frame header
pub const FRAME_HEADER_SIZE: usize = 6;

/// Largest payload a frame can carry
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Protocol version carried by control-channel hellos
pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

/// TLV tag of the authorization cookie in a service hello
pub const TLV_COOKIE: u16 = 0x0006;

// ----------------------------------------------------------------------------
// Channel
// ----------------------------------------------------------------------------

/// Frame channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Connection setup: version hello, cookie login
    Control,
    /// Records
    Data,
    /// Server-reported framing error
    Error,
    /// Sign-off / server-initiated close
    Close,
    /// Keep-alive no-op
    KeepAlive,
    Other(u8),
}

impl Channel {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Channel::Control,
            2 => Channel::Data,
            3 => Channel::Error,
            4 => Channel::Close,
            5 => Channel::KeepAlive,
            other => Channel::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Channel::Control => 1,
            Channel::Data => 2,
            Channel::Error => 3,
            Channel::Close => 4,
            Channel::KeepAlive => 5,
            Channel::Other(other) => *other,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.as_u8())
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One framed payload on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    channel: Channel,
    sequence: u16,
    payload: Vec<u8>,
}

impl Frame {
    /// Create a frame; the sequence is stamped by the owning connection
    pub fn new(channel: Channel, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(OwlchatError::invalid_argument(format!(
                "frame payload of {} bytes exceeds {}",
                payload.len(),
                MAX_FRAME_PAYLOAD
            )));
        }
        Ok(Self {
            channel,
            sequence: 0,
            payload,
        })
    }

    pub fn with_sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn set_sequence(&mut self, sequence: u16) {
        self.sequence = sequence;
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Always equal to `payload().len()`
    pub fn payload_len(&self) -> u16 {
        self.payload.len() as u16
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Control hello: protocol version, optionally followed by TLVs
    pub fn control_hello(tlvs: &TlvChain) -> Result<Self> {
        let mut payload = Vec::with_capacity(4 + tlvs.encoded_len());
        payload.put_u32(PROTOCOL_VERSION);
        payload.extend_from_slice(&tlvs.encode());
        Frame::new(Channel::Control, payload)
    }

    /// Control hello carrying an authorization cookie
    pub fn cookie_login(cookie: &[u8]) -> Result<Self> {
        let mut tlvs = TlvChain::new();
        tlvs.push(Tlv::new(TLV_COOKIE, cookie.to_vec())?);
        Frame::control_hello(&tlvs)
    }

    /// Version and trailing bytes of a control-channel payload
    pub fn control_version(&self) -> Result<(u32, &[u8])> {
        if self.channel != Channel::Control {
            return Err(OwlchatError::malformed(
                "control frame",
                format!("expected control channel, got {}", self.channel),
            ));
        }
        let mut reader = ByteReader::new(&self.payload, "control frame");
        let version = reader.read_u32()?;
        Ok((version, reader.rest()))
    }
}

// ----------------------------------------------------------------------------
// Codec
// ----------------------------------------------------------------------------

/// Why a buffer did not yield a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Partial frame; keep the bytes and wait for more
    #[error("incomplete frame")]
    NeedMoreData,
    /// Stream is not at a valid frame boundary; fatal to the connection
    #[error("corrupt frame: {0}")]
    Corrupt(ProtocolViolation),
}

impl From<FrameError> for OwlchatError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::NeedMoreData => OwlchatError::Protocol(ProtocolViolation::Truncated {
                what: "frame",
                needed: FRAME_HEADER_SIZE,
                available: 0,
            }),
            FrameError::Corrupt(violation) => OwlchatError::Protocol(violation),
        }
    }
}

/// Decode one frame from the front of `buf`
///
/// Returns the frame and the number of bytes it occupied.
pub fn decode_frame(buf: &[u8]) -> core::result::Result<(Frame, usize), FrameError> {
    let Some(&marker) = buf.first() else {
        return Err(FrameError::NeedMoreData);
    };
    if marker != FRAME_MARKER {
        return Err(FrameError::Corrupt(ProtocolViolation::BadMarker(marker)));
    }
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::NeedMoreData);
    }

    let channel = Channel::from_u8(buf[1]);
    let sequence = u16::from_be_bytes([buf[2], buf[3]]);
    let payload_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;

    let total = FRAME_HEADER_SIZE + payload_len;
    if buf.len() < total {
        return Err(FrameError::NeedMoreData);
    }

    let frame = Frame {
        channel,
        sequence,
        payload: buf[FRAME_HEADER_SIZE..total].to_vec(),
    };
    Ok((frame, total))
}

/// Encode a frame to its wire representation
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frame.encoded_len());
    bytes.put_u8(FRAME_MARKER);
    bytes.put_u8(frame.channel.as_u8());
    bytes.put_u16(frame.sequence);
    bytes.put_u16(frame.payload_len());
    bytes.put_bytes(&frame.payload);
    bytes
}

// ----------------------------------------------------------------------------
// Resumable Buffer
// ----------------------------------------------------------------------------

/// Accumulates stream bytes and yields complete frames in order
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    start: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.start > 0 && self.start >= self.buf.len() / 2 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as frames
    pub fn pending(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Next complete frame, `Ok(None)` when more bytes are needed
    pub fn next_frame(&mut self) -> core::result::Result<Option<Frame>, FrameError> {
        match decode_frame(&self.buf[self.start..]) {
            Ok((frame, consumed)) => {
                self.start += consumed;
                if self.start == self.buf.len() {
                    self.buf.clear();
                    self.start = 0;
                }
                Ok(Some(frame))
            }
            Err(FrameError::NeedMoreData) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.start = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_version_scenario() {
        let bytes = [0x2a, 0x01, 0x12, 0x34, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01];
        let (frame, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(frame.channel(), Channel::Control);
        assert_eq!(frame.sequence(), 0x1234);
        let (version, rest) = frame.control_version().unwrap();
        assert_eq!(version, 1);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame::new(Channel::Data, vec![0xaa, 0xbb])
            .unwrap()
            .with_sequence(0x0102);
        assert_eq!(
            encode_frame(&frame),
            vec![0x2a, 0x02, 0x01, 0x02, 0x00, 0x02, 0xaa, 0xbb]
        );
    }

    #[test]
    fn test_partial_frames_need_more_data() {
        let frame = Frame::new(Channel::Data, vec![1, 2, 3]).unwrap();
        let bytes = encode_frame(&frame);
        for cut in 0..bytes.len() {
            assert_eq!(decode_frame(&bytes[..cut]), Err(FrameError::NeedMoreData));
        }
    }

    #[test]
    fn test_bad_marker_is_corrupt() {
        let result = decode_frame(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            result,
            Err(FrameError::Corrupt(ProtocolViolation::BadMarker(0x00)))
        );
    }

    #[test]
    fn test_frame_buffer_yields_frames_in_order() {
        let first = Frame::new(Channel::Data, vec![1]).unwrap().with_sequence(7);
        let second = Frame::new(Channel::KeepAlive, vec![]).unwrap().with_sequence(8);
        let mut stream = encode_frame(&first);
        stream.extend(encode_frame(&second));

        let mut buffer = FrameBuffer::new();
        buffer.extend(&stream[..4]);
        assert_eq!(buffer.next_frame().unwrap(), None);
        buffer.extend(&stream[4..]);
        assert_eq!(buffer.next_frame().unwrap(), Some(first));
        assert_eq!(buffer.next_frame().unwrap(), Some(second));
        assert_eq!(buffer.next_frame().unwrap(), None);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_cookie_login_carries_cookie_tlv() {
        let frame = Frame::cookie_login(b"KEY").unwrap();
        let (version, rest) = frame.control_version().unwrap();
        assert_eq!(version, PROTOCOL_VERSION);
        let tlvs = TlvChain::decode(rest).unwrap();
        assert_eq!(tlvs.get(TLV_COOKIE, 0).unwrap().value(), b"KEY");
    }

    #[test]
    fn test_oversized_payload_rejected() {
        assert!(Frame::new(Channel::Data, vec![0; MAX_FRAME_PAYLOAD + 1]).is_err());
    }
}
