//! Outbound record builders
//!
//! One function per request the engine sends. Builders return [`Record`]s
//! with a zero request id; the session stamps ids at send time.

use crate::errors::Result;
use crate::protocol::auth::{self, ClientIdentity};
use crate::protocol::bytes::{check_u8_len, WireWrite};
use crate::protocol::chat::{RoomInfo, RoomKey};
use crate::protocol::families::{
    self, auth as auth_sub, bos, buddy, chat, chat_nav, generic, icbm, locate, lookup, ssi,
};
use crate::protocol::frame::{Channel, Frame};
use crate::protocol::icbm as im;
use crate::protocol::inbound::{
    TLV_CHAT_MESSAGE_INFO, TLV_CHAT_TEXT, TLV_PROFILE, TLV_PROFILE_ENCODING,
};
use crate::protocol::record::Record;
use crate::protocol::ssi::{encode_items, SsiItem, SsiOp};
use crate::protocol::tlv::{Tlv, TlvChain};
use crate::types::MessageFlags;

/// Capability advertised in locate info: chat invitations
pub const CAPABILITY_CHAT: [u8; 16] = [
    0x74, 0x8f, 0x24, 0x20, 0x62, 0x87, 0x11, 0xd1, 0x82, 0x22, 0x44, 0x45, 0x53, 0x54, 0x00, 0x00,
];

pub const TLV_CAPABILITIES: u16 = 0x0005;
pub const TLV_SERVICE_ROOM: u16 = 0x0001;
pub const PROFILE_ENCODING: &str = "text/aolrtf; charset=\"us-ascii\"";

/// Request type in a user info lookup: general profile
pub const INFO_TYPE_GENERAL: u16 = 0x0001;

// ----------------------------------------------------------------------------
// Frames
// ----------------------------------------------------------------------------

/// Empty keep-alive frame
pub fn keepalive() -> Result<Frame> {
    Frame::new(Channel::KeepAlive, Vec::new())
}

/// Empty sign-off frame
pub fn sign_off() -> Result<Frame> {
    Frame::new(Channel::Close, Vec::new())
}

// ----------------------------------------------------------------------------
// Authorizer
// ----------------------------------------------------------------------------

pub fn key_request(screen_name: &str) -> Result<Record> {
    let tlvs = TlvChain::new()
        .with(Tlv::string(auth::TLV_SCREEN_NAME, screen_name)?)
        .with(Tlv::empty(auth::TLV_KEY_UNKNOWN_4B))
        .with(Tlv::empty(auth::TLV_KEY_UNKNOWN_5A));
    Ok(Record::new(families::AUTH, auth_sub::KEY_REQUEST, tlvs.encode()))
}

pub fn login_request(
    screen_name: &str,
    password: &str,
    key: &[u8],
    identity: &ClientIdentity,
) -> Result<Record> {
    let hash = auth::password_hash(key, password);
    let mut tlvs = TlvChain::new()
        .with(Tlv::string(auth::TLV_SCREEN_NAME, screen_name)?)
        .with(Tlv::new(auth::TLV_PASSWORD_HASH, hash.to_vec())?)
        .with(Tlv::empty(auth::TLV_USE_NEW_HASH));
    identity.append_tlvs(&mut tlvs)?;
    Ok(Record::new(families::AUTH, auth_sub::LOGIN, tlvs.encode()))
}

// ----------------------------------------------------------------------------
// Generic Service Controls
// ----------------------------------------------------------------------------

/// Versions for each family the server offered
pub fn family_versions(offered: &[u16]) -> Record {
    let mut payload = Vec::with_capacity(offered.len() * 4);
    for family in offered {
        payload.put_u16(*family);
        payload.put_u16(families::family_version(*family));
    }
    Record::new(families::GENERIC, generic::VERSIONS, payload)
}

pub fn rate_request() -> Record {
    Record::new(families::GENERIC, generic::RATE_REQUEST, Vec::new())
}

pub fn rate_ack(class_ids: &[u16]) -> Record {
    let mut payload = Vec::with_capacity(class_ids.len() * 2);
    for id in class_ids {
        payload.put_u16(*id);
    }
    Record::new(families::GENERIC, generic::RATE_ACK, payload)
}

/// Client ready with version and tool info for each family in use
pub fn client_ready(in_use: &[u16]) -> Record {
    let mut payload = Vec::with_capacity(in_use.len() * 8);
    for family in in_use {
        payload.put_u16(*family);
        payload.put_u16(families::family_version(*family));
        payload.put_u16(families::TOOL_ID);
        payload.put_u16(families::TOOL_VERSION);
    }
    Record::new(families::GENERIC, generic::CLIENT_READY, payload)
}

pub fn self_info_request() -> Record {
    Record::new(families::GENERIC, generic::SELF_INFO_REQUEST, Vec::new())
}

pub fn pause_ack(paused: &[u16]) -> Record {
    let mut payload = Vec::with_capacity(paused.len() * 2);
    for family in paused {
        payload.put_u16(*family);
    }
    Record::new(families::GENERIC, generic::PAUSE_ACK, payload)
}

pub fn verify_reply(digest: &[u8; 16]) -> Record {
    let mut payload = Vec::with_capacity(18);
    payload.put_u16(0x0010);
    payload.put_bytes(digest);
    Record::new(families::GENERIC, generic::VERIFY_REPLY, payload)
}

/// Ask the main connection for a redirect to `family`
pub fn service_request(family: u16, room: Option<&RoomKey>) -> Result<Record> {
    let mut payload = Vec::new();
    payload.put_u16(family);
    if let Some(room) = room {
        let tlvs = TlvChain::new().with(Tlv::new(TLV_SERVICE_ROOM, room.encode()?)?);
        payload.extend_from_slice(&tlvs.encode());
    }
    Ok(Record::new(families::GENERIC, generic::SERVICE_REQUEST, payload))
}

// ----------------------------------------------------------------------------
// Main Connection Setup
// ----------------------------------------------------------------------------

pub fn locate_rights_request() -> Record {
    Record::new(families::LOCATE, locate::RIGHTS_REQUEST, Vec::new())
}

pub fn buddy_rights_request() -> Record {
    Record::new(families::BUDDY, buddy::RIGHTS_REQUEST, Vec::new())
}

pub fn icbm_params_request() -> Record {
    Record::new(families::ICBM, icbm::PARAMS_REQUEST, Vec::new())
}

pub fn bos_rights_request() -> Record {
    Record::new(families::BOS, bos::RIGHTS_REQUEST, Vec::new())
}

pub fn ssi_rights_request() -> Record {
    Record::new(families::SSI, ssi::RIGHTS_REQUEST, Vec::new())
}

/// Request the full list (no cached timestamp)
pub fn ssi_list_request() -> Record {
    let mut payload = Vec::with_capacity(6);
    payload.put_u32(0);
    payload.put_u16(0);
    Record::new(families::SSI, ssi::LIST_REQUEST, payload)
}

pub fn ssi_activate() -> Record {
    Record::new(families::SSI, ssi::ACTIVATE, Vec::new())
}

/// Profile (optional) and capabilities
pub fn set_locate_info(profile: Option<&str>) -> Result<Record> {
    let mut tlvs = TlvChain::new();
    if let Some(profile) = profile {
        tlvs.push(Tlv::string(TLV_PROFILE_ENCODING, PROFILE_ENCODING)?);
        tlvs.push(Tlv::string(TLV_PROFILE, profile)?);
    }
    tlvs.push(Tlv::new(TLV_CAPABILITIES, CAPABILITY_CHAT.to_vec())?);
    Ok(Record::new(families::LOCATE, locate::SET_INFO, tlvs.encode()))
}

/// Default ICBM parameters for every channel
pub fn icbm_set_params() -> Record {
    let mut payload = Vec::with_capacity(16);
    payload.put_u16(0x0000);
    payload.put_u32(0x0000_000b);
    payload.put_u16(8000);
    payload.put_u16(999);
    payload.put_u16(999);
    payload.put_u32(0);
    Record::new(families::ICBM, icbm::SET_PARAMS, payload)
}

// ----------------------------------------------------------------------------
// Messaging, Lookup and Buddy List
// ----------------------------------------------------------------------------

/// Channel-1 instant message
pub fn send_im(target: &str, text: &str, flags: MessageFlags, cookie: [u8; 8]) -> Result<Record> {
    check_u8_len("screen name", target.as_bytes())?;
    let mut payload = Vec::new();
    payload.put_bytes(&cookie);
    payload.put_u16(im::CHANNEL_IM);
    payload.put_u8_prefixed(target.as_bytes());

    let mut tlvs = TlvChain::new().with(Tlv::new(
        im::TLV_MESSAGE_BLOCK,
        im::encode_message_block(text)?,
    )?);
    if flags.contains(MessageFlags::AUTO_RESPONSE) {
        tlvs.push(Tlv::empty(im::TLV_AUTO_RESPONSE));
    }
    if flags.contains(MessageFlags::ACK_REQUESTED) {
        tlvs.push(Tlv::empty(im::TLV_ACK_REQUESTED));
    }
    if flags.contains(MessageFlags::OFFLINE) {
        tlvs.push(Tlv::empty(im::TLV_STORE_OFFLINE));
    }
    payload.extend_from_slice(&tlvs.encode());
    Ok(Record::new(families::ICBM, icbm::SEND, payload))
}

pub fn user_info_request(screen_name: &str) -> Result<Record> {
    check_u8_len("screen name", screen_name.as_bytes())?;
    let mut payload = Vec::new();
    payload.put_u16(INFO_TYPE_GENERAL);
    payload.put_u8_prefixed(screen_name.as_bytes());
    Ok(Record::new(families::LOCATE, locate::INFO_REQUEST, payload))
}

pub fn search_by_email(address: &str) -> Record {
    Record::new(
        families::USER_LOOKUP,
        lookup::SEARCH_EMAIL,
        address.as_bytes().to_vec(),
    )
}

pub fn ssi_edit_start() -> Record {
    Record::new(families::SSI, ssi::EDIT_START, Vec::new())
}

pub fn ssi_edit_end() -> Record {
    Record::new(families::SSI, ssi::EDIT_END, Vec::new())
}

pub fn ssi_items(op: SsiOp, items: &[SsiItem]) -> Result<Record> {
    let subtype = match op {
        SsiOp::Add => ssi::ADD,
        SsiOp::Modify => ssi::MODIFY,
        SsiOp::Delete => ssi::DELETE,
    };
    Ok(Record::new(families::SSI, subtype, encode_items(items)?))
}

// ----------------------------------------------------------------------------
// Chat
// ----------------------------------------------------------------------------

pub fn chat_nav_rights_request() -> Record {
    Record::new(families::CHAT_NAV, chat_nav::RIGHTS_REQUEST, Vec::new())
}

/// Create (or find) a room by name on an exchange
pub fn chat_create_room(exchange: u16, name: &str) -> Result<Record> {
    let info = RoomInfo::create_request(exchange, name)?;
    Ok(Record::new(families::CHAT_NAV, chat_nav::CREATE, info.encode()?))
}

/// Message to everyone in the room this connection serves
pub fn chat_send(text: &str, cookie: [u8; 8]) -> Result<Record> {
    let mut payload = Vec::new();
    payload.put_bytes(&cookie);
    payload.put_u16(im::CHANNEL_CHAT);

    let info = TlvChain::new().with(Tlv::string(TLV_CHAT_TEXT, text)?);
    let tlvs = TlvChain::new()
        .with(Tlv::empty(0x0001))
        .with(Tlv::empty(0x0006))
        .with(Tlv::new(TLV_CHAT_MESSAGE_INFO, info.encode())?);
    payload.extend_from_slice(&tlvs.encode());
    Ok(Record::new(families::CHAT, chat::SEND, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::inbound::Inbound;
    use crate::protocol::ByteReader;

    #[test]
    fn test_key_request_tlvs() {
        let record = key_request("alice").unwrap();
        assert_eq!(record.key(), (families::AUTH, auth_sub::KEY_REQUEST));
        let tlvs = TlvChain::decode(&record.payload).unwrap();
        assert_eq!(tlvs.get_string(auth::TLV_SCREEN_NAME, 0).unwrap(), "alice");
        assert!(tlvs.contains(auth::TLV_KEY_UNKNOWN_4B));
        assert!(tlvs.contains(auth::TLV_KEY_UNKNOWN_5A));
    }

    #[test]
    fn test_login_request_carries_hash_not_password() {
        let record = login_request("alice", "hunter2", b"1234", &ClientIdentity::default()).unwrap();
        let tlvs = TlvChain::decode(&record.payload).unwrap();
        assert_eq!(
            tlvs.get(auth::TLV_PASSWORD_HASH, 0).unwrap().value(),
            auth::password_hash(b"1234", "hunter2")
        );
        assert!(!record.payload.windows(7).any(|w| w == b"hunter2"));
    }

    #[test]
    fn test_client_ready_layout() {
        let record = client_ready(&[families::GENERIC]);
        assert_eq!(
            record.payload,
            vec![0x00, 0x01, 0x00, 0x03, 0x01, 0x10, 0x04, 0x7b]
        );
    }

    #[test]
    fn test_send_im_layout() {
        let record = send_im(
            "bob",
            "hi",
            MessageFlags::ACK_REQUESTED,
            [9, 9, 9, 9, 9, 9, 9, 9],
        )
        .unwrap();
        let mut reader = ByteReader::new(&record.payload, "test");
        assert_eq!(reader.read_bytes(8).unwrap(), &[9; 8]);
        assert_eq!(reader.read_u16().unwrap(), im::CHANNEL_IM);
        assert_eq!(reader.read_u8_prefixed().unwrap(), b"bob");
        let tlvs = TlvChain::decode(reader.rest()).unwrap();
        let text = im::decode_message_block(tlvs.get(im::TLV_MESSAGE_BLOCK, 0).unwrap().value())
            .unwrap();
        assert_eq!(text.text, "hi");
        assert!(tlvs.contains(im::TLV_ACK_REQUESTED));
        assert!(!tlvs.contains(im::TLV_AUTO_RESPONSE));
    }

    #[test]
    fn test_service_request_with_room() {
        let room = RoomKey {
            exchange: 4,
            cookie: b"!aol://room".to_vec(),
            instance: 0,
        };
        let record = service_request(families::CHAT, Some(&room)).unwrap();
        let mut reader = ByteReader::new(&record.payload, "test");
        assert_eq!(reader.read_u16().unwrap(), families::CHAT);
        let tlvs = TlvChain::decode(reader.rest()).unwrap();
        assert_eq!(
            tlvs.get(TLV_SERVICE_ROOM, 0).unwrap().value(),
            room.encode().unwrap().as_slice()
        );
    }

    #[test]
    fn test_chat_send_decodes_as_incoming_shape() {
        let mut record = chat_send("hello", [0; 8]).unwrap();
        // The server reflects the same layout back as an incoming message
        record.subtype = chat::INCOMING;
        let Inbound::ChatIncoming(message) = Inbound::decode(&record).unwrap() else {
            panic!("expected chat message");
        };
        assert_eq!(message.text, "hello");
        assert!(message.sender.is_none());
    }

    #[test]
    fn test_verify_reply() {
        let record = verify_reply(&[0xab; 16]);
        assert_eq!(&record.payload[..2], &[0x00, 0x10]);
        assert_eq!(record.payload.len(), 18);
    }
}
