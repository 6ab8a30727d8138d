use crate::errors::{OwlchatError, Result};
use crate::protocol::bytes::{check_u16_len, ByteReader, WireWrite};

/// Size of a TLV header (tag + length)
pub const TLV_HEADER_SIZE: usize = 4;

/// A single tag-length-value entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    tag: u16,
    value: Vec<u8>,
}

impl Tlv {
    /// Create a TLV entry; the value must fit a u16 length
    pub fn new(tag: u16, value: Vec<u8>) -> Result<Self> {
        check_u16_len("TLV value", &value)?;
        Ok(Self { tag, value })
    }

    /// Create a zero-length TLV used as a flag
    pub fn empty(tag: u16) -> Self {
        Self {
            tag,
            value: Vec::new(),
        }
    }

    pub fn u8(tag: u16, value: u8) -> Self {
        Self {
            tag,
            value: vec![value],
        }
    }

    pub fn u16(tag: u16, value: u16) -> Self {
        Self {
            tag,
            value: value.to_be_bytes().to_vec(),
        }
    }

    pub fn u32(tag: u16, value: u32) -> Self {
        Self {
            tag,
            value: value.to_be_bytes().to_vec(),
        }
    }

    /// String value, no terminator
    pub fn string(tag: u16, value: &str) -> Result<Self> {
        Self::new(tag, value.as_bytes().to_vec())
    }

    pub fn tag(&self) -> u16 {
        self.tag
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Value as a big-endian u16
    pub fn as_u16(&self) -> Result<u16> {
        match self.value.as_slice() {
            [a, b] => Ok(u16::from_be_bytes([*a, *b])),
            other => Err(OwlchatError::malformed(
                "TLV",
                format!("tag 0x{:04x}: expected 2 bytes, got {}", self.tag, other.len()),
            )),
        }
    }

    /// Value as a big-endian u32
    pub fn as_u32(&self) -> Result<u32> {
        match self.value.as_slice() {
            [a, b, c, d] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
            other => Err(OwlchatError::malformed(
                "TLV",
                format!("tag 0x{:04x}: expected 4 bytes, got {}", self.tag, other.len()),
            )),
        }
    }

    /// Value as text; the length is authoritative and invalid UTF-8 is replaced
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }

    /// Encode this TLV entry to bytes
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        // Tag (2 bytes), length (2 bytes), value
        out.put_u16(self.tag);
        out.put_u16(self.value.len() as u16);
        out.put_bytes(&self.value);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(TLV_HEADER_SIZE + self.value.len());
        self.encode_into(&mut encoded);
        encoded
    }

    /// Decode a TLV entry from bytes, returning it and the bytes consumed
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(data, "TLV");
        let tlv = Self::read(&mut reader)?;
        Ok((tlv, reader.position()))
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let tag = reader.read_u16()?;
        let value = reader.read_u16_prefixed()?.to_vec();
        Ok(Self { tag, value })
    }
}

/// Ordered TLV sequence; duplicate tags are legal and position-significant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvChain {
    entries: Vec<Tlv>,
}

impl TlvChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: Tlv) {
        self.entries.push(entry);
    }

    /// Builder-style push
    pub fn with(mut self, entry: Tlv) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn entries(&self) -> &[Tlv] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `occurrence`-th entry (zero-based) carrying `tag`
    pub fn get(&self, tag: u16, occurrence: usize) -> Option<&Tlv> {
        self.entries
            .iter()
            .filter(|entry| entry.tag == tag)
            .nth(occurrence)
    }

    /// Every entry carrying `tag`, in order
    pub fn all(&self, tag: u16) -> impl Iterator<Item = &Tlv> {
        self.entries.iter().filter(move |entry| entry.tag == tag)
    }

    pub fn count(&self, tag: u16) -> usize {
        self.all(tag).count()
    }

    pub fn contains(&self, tag: u16) -> bool {
        self.get(tag, 0).is_some()
    }

    pub fn get_u16(&self, tag: u16, occurrence: usize) -> Result<Option<u16>> {
        self.get(tag, occurrence).map(Tlv::as_u16).transpose()
    }

    pub fn get_u32(&self, tag: u16, occurrence: usize) -> Result<Option<u32>> {
        self.get(tag, occurrence).map(Tlv::as_u32).transpose()
    }

    pub fn get_string(&self, tag: u16, occurrence: usize) -> Option<String> {
        self.get(tag, occurrence).map(Tlv::as_string)
    }

    /// The `occurrence`-th entry carrying `tag`, or a protocol error naming it
    pub fn require(&self, tag: u16, occurrence: usize) -> Result<&Tlv> {
        self.get(tag, occurrence).ok_or_else(|| {
            OwlchatError::malformed(
                "TLV chain",
                format!("missing tag 0x{:04x} (occurrence {})", tag, occurrence),
            )
        })
    }

    pub fn encoded_len(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| TLV_HEADER_SIZE + entry.len())
            .sum()
    }

    /// Encode all TLV entries to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(self.encoded_len());
        for entry in &self.entries {
            entry.encode_into(&mut encoded);
        }
        encoded
    }

    /// Decode entries until `data` is exhausted
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data, "TLV chain");
        let mut chain = TlvChain::new();
        while !reader.is_empty() {
            chain.push(Tlv::read(&mut reader)?);
        }
        Ok(chain)
    }

    /// Decode exactly `count` entries from the reader
    pub fn decode_counted(reader: &mut ByteReader<'_>, count: usize) -> Result<Self> {
        let mut chain = TlvChain::new();
        for _ in 0..count {
            chain.push(Tlv::read(reader)?);
        }
        Ok(chain)
    }

    /// Decode a u16-length-prefixed block of entries from the reader
    pub fn decode_sized(reader: &mut ByteReader<'_>) -> Result<Self> {
        let block = reader.read_u16_prefixed()?;
        Self::decode(block)
    }

    /// Encode with a u16 entry-count prefix
    pub fn encode_counted(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.encoded_len());
        out.put_u16(self.entries.len() as u16);
        out.extend_from_slice(&self.encode());
        out
    }

    /// Encode with a u16 byte-length prefix
    pub fn encode_sized(&self) -> Vec<u8> {
        let body = self.encode();
        let mut out = Vec::with_capacity(2 + body.len());
        out.put_u16_prefixed(&body);
        out
    }
}

impl FromIterator<Tlv> for TlvChain {
    fn from_iter<I: IntoIterator<Item = Tlv>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Decode a whole buffer as a TLV chain
pub fn decode_tlv_chain(bytes: &[u8]) -> Result<TlvChain> {
    TlvChain::decode(bytes)
}

/// Encode a TLV chain
pub fn encode_tlv_chain(chain: &TlvChain) -> Vec<u8> {
    chain.encode()
}
