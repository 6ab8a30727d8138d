//! Big-endian cursor helpers shared by the codecs

use crate::errors::{OwlchatError, ProtocolViolation, Result};

/// Bounds-checked big-endian reader over a borrowed buffer
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
    what: &'static str,
}

impl<'a> ByteReader<'a> {
    /// `what` names the structure being read, for error messages
    pub fn new(data: &'a [u8], what: &'static str) -> Self {
        Self {
            data,
            offset: 0,
            what,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    fn need(&self, count: usize) -> Result<()> {
        if self.remaining() < count {
            return Err(OwlchatError::Protocol(ProtocolViolation::Truncated {
                what: self.what,
                needed: count,
                available: self.remaining(),
            }));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let value = self.data[self.offset];
        self.offset += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        self.need(count)?;
        let slice = &self.data[self.offset..self.offset + count];
        self.offset += count;
        Ok(slice)
    }

    /// u8 length, then that many bytes
    pub fn read_u8_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u8()? as usize;
        self.read_bytes(len)
    }

    /// u16 length, then that many bytes
    pub fn read_u16_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    /// Everything not yet consumed
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.offset..];
        self.offset = self.data.len();
        slice
    }
}

/// Big-endian append helpers for outbound buffers
pub trait WireWrite {
    fn put_u8(&mut self, value: u8);
    fn put_u16(&mut self, value: u16);
    fn put_u32(&mut self, value: u32);
    fn put_bytes(&mut self, value: &[u8]);
    /// u8 length prefix; callers guarantee `value.len() <= 255`
    fn put_u8_prefixed(&mut self, value: &[u8]);
    /// u16 length prefix; callers guarantee `value.len() <= 65535`
    fn put_u16_prefixed(&mut self, value: &[u8]);
}

impl WireWrite for Vec<u8> {
    fn put_u8(&mut self, value: u8) {
        self.push(value);
    }

    fn put_u16(&mut self, value: u16) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    fn put_bytes(&mut self, value: &[u8]) {
        self.extend_from_slice(value);
    }

    fn put_u8_prefixed(&mut self, value: &[u8]) {
        self.push(value.len() as u8);
        self.extend_from_slice(value);
    }

    fn put_u16_prefixed(&mut self, value: &[u8]) {
        self.put_u16(value.len() as u16);
        self.extend_from_slice(value);
    }
}

/// Reject values that do not fit a u8 length prefix
pub fn check_u8_len(what: &'static str, value: &[u8]) -> Result<()> {
    if value.len() > u8::MAX as usize {
        return Err(OwlchatError::invalid_argument(format!(
            "{} too long ({} bytes, max 255)",
            what,
            value.len()
        )));
    }
    Ok(())
}

/// Reject values that do not fit a u16 length prefix
pub fn check_u16_len(what: &'static str, value: &[u8]) -> Result<()> {
    if value.len() > u16::MAX as usize {
        return Err(OwlchatError::invalid_argument(format!(
            "{} too long ({} bytes, max 65535)",
            what,
            value.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reads_big_endian() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut reader = ByteReader::new(&data, "test");
        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert_eq!(reader.read_u16().unwrap(), 0x0203);
        assert_eq!(reader.read_u32().unwrap(), 0x04050607);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_reader_truncation_is_error() {
        let data = [0x00, 0x05, b'a', b'b'];
        let mut reader = ByteReader::new(&data, "string");
        let err = reader.read_u16_prefixed().unwrap_err();
        assert!(matches!(
            err,
            OwlchatError::Protocol(ProtocolViolation::Truncated {
                needed: 5,
                available: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_writer_prefixes() {
        let mut out = Vec::new();
        out.put_u8_prefixed(b"ab");
        out.put_u16_prefixed(b"c");
        out.put_u32(0xdeadbeef);
        assert_eq!(
            out,
            vec![2, b'a', b'b', 0, 1, b'c', 0xde, 0xad, 0xbe, 0xef]
        );
    }
}
