//! Login hashing and client identification
//!
//! The authorizer challenges every login with a per-attempt key. The
//! client never sends the password; it sends
//! `md5(key || md5(password) || AUTH_HASH_SUFFIX)` together with a fixed
//! set of client-identification TLVs.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::protocol::tlv::{Tlv, TlvChain};

/// Constant suffix mixed into the login hash
pub const AUTH_HASH_SUFFIX: &[u8] = b"AOL Instant Messenger (SM)";

pub const TLV_SCREEN_NAME: u16 = 0x0001;
pub const TLV_CLIENT_STRING: u16 = 0x0003;
pub const TLV_ERROR_URL: u16 = 0x0004;
pub const TLV_BOS_ADDRESS: u16 = 0x0005;
pub const TLV_COOKIE: u16 = 0x0006;
pub const TLV_ERROR_CODE: u16 = 0x0008;
pub const TLV_DISCONNECT_REASON: u16 = 0x0009;
pub const TLV_COUNTRY: u16 = 0x000e;
pub const TLV_LANGUAGE: u16 = 0x000f;
pub const TLV_DISTRIBUTION: u16 = 0x0014;
pub const TLV_CLIENT_ID: u16 = 0x0016;
pub const TLV_MAJOR: u16 = 0x0017;
pub const TLV_MINOR: u16 = 0x0018;
pub const TLV_POINT: u16 = 0x0019;
pub const TLV_BUILD: u16 = 0x001a;
pub const TLV_PASSWORD_HASH: u16 = 0x0025;
pub const TLV_SSI_USE: u16 = 0x004a;
pub const TLV_USE_NEW_HASH: u16 = 0x004c;
pub const TLV_KEY_UNKNOWN_4B: u16 = 0x004b;
pub const TLV_KEY_UNKNOWN_5A: u16 = 0x005a;

fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Hash sent in place of the password
pub fn password_hash(key: &[u8], password: &str) -> [u8; 16] {
    let password_digest = md5(&[password.as_bytes()]);
    md5(&[key, &password_digest, AUTH_HASH_SUFFIX])
}

/// Answer to a client-verification challenge
///
/// Hashes `length` bytes at `offset` of the cached client binary. Without a
/// binary, or when the window falls outside it, the digest of empty input
/// is returned.
pub fn verification_digest(binary: Option<&[u8]>, offset: u32, length: u32) -> [u8; 16] {
    let window = binary.and_then(|bytes| {
        let start = offset as usize;
        let end = start.checked_add(length as usize)?;
        bytes.get(start..end)
    });
    match window {
        Some(slice) if length > 0 => md5(&[slice]),
        _ => md5(&[]),
    }
}

/// Static client-identification fields sent with every login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientIdentity {
    pub client_string: String,
    pub client_id: u16,
    pub major: u16,
    pub minor: u16,
    pub point: u16,
    pub build: u16,
    pub distribution: u32,
    pub language: String,
    pub country: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            client_string: "AOL Instant Messenger, version 5.1.3036/WIN32".to_string(),
            client_id: 0x0109,
            major: 5,
            minor: 1,
            point: 0,
            build: 3036,
            distribution: 0x0000_00d2,
            language: "en".to_string(),
            country: "us".to_string(),
        }
    }
}

impl ClientIdentity {
    /// Append the identification TLVs in wire order
    pub fn append_tlvs(&self, chain: &mut TlvChain) -> Result<()> {
        chain.push(Tlv::string(TLV_CLIENT_STRING, &self.client_string)?);
        chain.push(Tlv::u16(TLV_CLIENT_ID, self.client_id));
        chain.push(Tlv::u16(TLV_MAJOR, self.major));
        chain.push(Tlv::u16(TLV_MINOR, self.minor));
        chain.push(Tlv::u16(TLV_POINT, self.point));
        chain.push(Tlv::u16(TLV_BUILD, self.build));
        chain.push(Tlv::u32(TLV_DISTRIBUTION, self.distribution));
        chain.push(Tlv::string(TLV_LANGUAGE, &self.language)?);
        chain.push(Tlv::string(TLV_COUNTRY, &self.country)?);
        chain.push(Tlv::u8(TLV_SSI_USE, 0x01));
        Ok(())
    }
}
