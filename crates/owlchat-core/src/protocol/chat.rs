//! Chat room descriptors
//!
//! A room is addressed by `(exchange, cookie, instance)`; the cookie is the
//! room key carried on service requests for a chat connection.

use crate::errors::Result;
use crate::protocol::bytes::{check_u8_len, ByteReader, WireWrite};
use crate::protocol::tlv::{Tlv, TlvChain};

pub const TLV_ROOM_NAME: u16 = 0x00d3;
pub const TLV_ROOM_INFO: u16 = 0x0004;

/// Cookie that asks the directory to create (or find) a room
pub const CREATE_COOKIE: &str = "create";
/// Instance placeholder used with the create cookie
pub const CREATE_INSTANCE: u16 = 0xffff;

/// Identity of a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomKey {
    pub exchange: u16,
    pub cookie: Vec<u8>,
    pub instance: u16,
}

impl RoomKey {
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            exchange: reader.read_u16()?,
            cookie: reader.read_u8_prefixed()?.to_vec(),
            instance: reader.read_u16()?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        check_u8_len("room cookie", &self.cookie)?;
        out.put_u16(self.exchange);
        out.put_u8_prefixed(&self.cookie);
        out.put_u16(self.instance);
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write(&mut out)?;
        Ok(out)
    }
}

/// Room key plus descriptive TLVs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub key: RoomKey,
    pub detail: u8,
    pub tlvs: TlvChain,
}

impl RoomInfo {
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let key = RoomKey::read(reader)?;
        let detail = reader.read_u8()?;
        let count = reader.read_u16()? as usize;
        let tlvs = TlvChain::decode_counted(reader, count)?;
        Ok(Self { key, detail, tlvs })
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::read(&mut ByteReader::new(data, "room info"))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.key.write(&mut out)?;
        out.put_u8(self.detail);
        out.extend_from_slice(&self.tlvs.encode_counted());
        Ok(out)
    }

    pub fn name(&self) -> Option<String> {
        self.tlvs.get_string(TLV_ROOM_NAME, 0)
    }

    /// Info block asking the directory to create a room called `name`
    pub fn create_request(exchange: u16, name: &str) -> Result<Self> {
        Ok(Self {
            key: RoomKey {
                exchange,
                cookie: CREATE_COOKIE.as_bytes().to_vec(),
                instance: CREATE_INSTANCE,
            },
            detail: 0x01,
            tlvs: TlvChain::new().with(Tlv::string(TLV_ROOM_NAME, name)?),
        })
    }
}
