//! Record header codec
//!
//! Data-channel frames carry exactly one record: a ten-byte header naming
//! the `(family, subtype)` discriminant, flags and a request id, followed by
//! the payload. Decoding borrows nothing from the frame; a `Record` owns its
//! payload and is consumed by the dispatch call that processes it.

use crate::errors::{OwlchatError, Result};
use crate::protocol::bytes::{ByteReader, WireWrite};
use crate::protocol::frame::{Channel, Frame};

/// Size of the record header
pub const RECORD_HEADER_SIZE: usize = 10;

/// More replies with the same request id follow
pub const FLAG_MORE_REPLIES: u16 = 0x0001;

/// Payload starts with a u16-length-prefixed opaque block
pub const FLAG_HAS_PREFIX: u16 = 0x8000;

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub family: u16,
    pub subtype: u16,
    pub flags: u16,
    pub request_id: u32,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(family: u16, subtype: u16, payload: Vec<u8>) -> Self {
        Self {
            family,
            subtype,
            flags: 0,
            request_id: 0,
            payload,
        }
    }

    pub fn with_request_id(mut self, request_id: u32) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    /// `(family, subtype)` dispatch key
    pub fn key(&self) -> (u16, u16) {
        (self.family, self.subtype)
    }

    pub fn has_more_replies(&self) -> bool {
        self.flags & FLAG_MORE_REPLIES != 0
    }

    /// Payload with the optional flagged prefix block skipped
    pub fn body(&self) -> Result<&[u8]> {
        if self.flags & FLAG_HAS_PREFIX == 0 {
            return Ok(&self.payload);
        }
        let mut reader = ByteReader::new(&self.payload, "record prefix");
        reader.read_u16_prefixed()?;
        Ok(reader.rest())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + self.payload.len());
        out.put_u16(self.family);
        out.put_u16(self.subtype);
        out.put_u16(self.flags);
        out.put_u32(self.request_id);
        out.put_bytes(&self.payload);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data, "record header");
        let family = reader.read_u16()?;
        let subtype = reader.read_u16()?;
        let flags = reader.read_u16()?;
        let request_id = reader.read_u32()?;
        Ok(Self {
            family,
            subtype,
            flags,
            request_id,
            payload: reader.rest().to_vec(),
        })
    }

    /// Wrap into a data-channel frame
    pub fn into_frame(&self) -> Result<Frame> {
        Frame::new(Channel::Data, self.encode())
    }

    /// Decode the record carried by a data-channel frame
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.channel() != Channel::Data {
            return Err(OwlchatError::malformed(
                "record",
                format!("frame on {} does not carry a record", frame.channel()),
            ));
        }
        Self::decode(frame.payload())
    }
}
