//! User info block
//!
//! Presence, warning and lookup records identify a user with a compact
//! block: a u8-length screen name, the u16 warning level, and a
//! count-prefixed TLV chain of attributes.

use crate::errors::Result;
use crate::protocol::bytes::{check_u8_len, ByteReader, WireWrite};
use crate::protocol::tlv::TlvChain;

pub const TLV_USER_CLASS: u16 = 0x0001;
pub const TLV_MEMBER_SINCE: u16 = 0x0002;
pub const TLV_ONLINE_SINCE: u16 = 0x0003;
pub const TLV_IDLE_MINUTES: u16 = 0x0004;
pub const TLV_CAPABILITIES: u16 = 0x000d;
pub const TLV_SESSION_LENGTH: u16 = 0x000f;

/// Identity and attributes of one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub screen_name: String,
    pub warning_level: u16,
    pub tlvs: TlvChain,
}

impl UserInfo {
    pub fn new<S: Into<String>>(screen_name: S, warning_level: u16) -> Self {
        Self {
            screen_name: screen_name.into(),
            warning_level,
            tlvs: TlvChain::new(),
        }
    }

    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let screen_name = String::from_utf8_lossy(reader.read_u8_prefixed()?).into_owned();
        let warning_level = reader.read_u16()?;
        let count = reader.read_u16()? as usize;
        let tlvs = TlvChain::decode_counted(reader, count)?;
        Ok(Self {
            screen_name,
            warning_level,
            tlvs,
        })
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::read(&mut ByteReader::new(data, "user info"))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        check_u8_len("screen name", self.screen_name.as_bytes())?;
        let mut out = Vec::new();
        out.put_u8_prefixed(self.screen_name.as_bytes());
        out.put_u16(self.warning_level);
        out.extend_from_slice(&self.tlvs.encode_counted());
        Ok(out)
    }

    pub fn user_class(&self) -> Option<u16> {
        self.tlvs.get_u16(TLV_USER_CLASS, 0).ok().flatten()
    }

    /// Seconds since the epoch the user signed on
    pub fn online_since(&self) -> Option<u32> {
        self.tlvs.get_u32(TLV_ONLINE_SINCE, 0).ok().flatten()
    }

    pub fn idle_minutes(&self) -> Option<u16> {
        self.tlvs.get_u16(TLV_IDLE_MINUTES, 0).ok().flatten()
    }

    /// Idle time in seconds, zero when not idle
    pub fn idle_seconds(&self) -> u32 {
        u32::from(self.idle_minutes().unwrap_or(0)) * 60
    }

    /// 16-byte capability identifiers
    pub fn capabilities(&self) -> Vec<[u8; 16]> {
        self.tlvs
            .get(TLV_CAPABILITIES, 0)
            .map(|tlv| {
                tlv.value()
                    .chunks_exact(16)
                    .filter_map(|chunk| <[u8; 16]>::try_from(chunk).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}
