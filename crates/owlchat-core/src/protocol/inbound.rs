//! Typed inbound records
//!
//! Every record the engine reacts to is decoded into a concrete variant
//! before any handler sees it. Handlers match on [`Inbound`] instead of
//! picking bytes out of payloads; a decoding failure is a protocol
//! violation on the connection that carried the record.

use crate::errors::{OwlchatError, Result};
use crate::protocol::auth;
use crate::protocol::bytes::ByteReader;
use crate::protocol::chat::{RoomInfo, TLV_ROOM_INFO};
use crate::protocol::families::{
    self, auth as auth_sub, buddy, chat, chat_nav, generic, icbm, locate, lookup, ssi,
};
use crate::protocol::icbm::{self as im, MessageText};
use crate::protocol::record::Record;
use crate::protocol::ssi::{decode_items, SsiItem, SsiList, SsiOp};
use crate::protocol::tlv::TlvChain;
use crate::protocol::userinfo::UserInfo;
use crate::rate::{RateChange, RateInfo};
use crate::types::{Cookie, MessageFlags};

pub const TLV_REDIRECT_FAMILY: u16 = 0x000d;
pub const TLV_REDIRECT_ADDRESS: u16 = 0x0005;
pub const TLV_REDIRECT_COOKIE: u16 = 0x0006;

pub const TLV_PROFILE_ENCODING: u16 = 0x0001;
pub const TLV_PROFILE: u16 = 0x0002;
pub const TLV_AWAY_ENCODING: u16 = 0x0003;
pub const TLV_AWAY_MESSAGE: u16 = 0x0004;

pub const TLV_SEARCH_NAME: u16 = 0x0001;

pub const TLV_CHAT_SENDER: u16 = 0x0003;
pub const TLV_CHAT_MESSAGE_INFO: u16 = 0x0005;
pub const TLV_CHAT_TEXT: u16 = 0x0001;

// ----------------------------------------------------------------------------
// Payload Structures
// ----------------------------------------------------------------------------

/// Outcome reported by the authorizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Success {
        screen_name: Option<String>,
        address: String,
        cookie: Cookie,
    },
    Failure {
        code: u16,
        url: Option<String>,
    },
}

impl AuthResult {
    /// Interpret an authorizer TLV chain (record payload or legacy close frame)
    pub fn from_tlvs(tlvs: &TlvChain) -> Result<Self> {
        if let Some(code) = tlvs.get_u16(auth::TLV_ERROR_CODE, 0)? {
            return Ok(AuthResult::Failure {
                code,
                url: tlvs.get_string(auth::TLV_ERROR_URL, 0),
            });
        }
        let address = tlvs.require(auth::TLV_BOS_ADDRESS, 0)?.as_string();
        let cookie = Cookie::new(tlvs.require(auth::TLV_COOKIE, 0)?.value().to_vec());
        Ok(AuthResult::Success {
            screen_name: tlvs.get_string(auth::TLV_SCREEN_NAME, 0),
            address,
            cookie,
        })
    }
}

/// Server instruction to open a service connection elsewhere
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub family: u16,
    pub address: String,
    pub cookie: Cookie,
}

impl Redirect {
    pub fn from_tlvs(tlvs: &TlvChain) -> Result<Self> {
        let family = tlvs
            .get_u16(TLV_REDIRECT_FAMILY, 0)?
            .ok_or_else(|| OwlchatError::malformed("redirect", "missing service family"))?;
        Ok(Self {
            family,
            address: tlvs.require(TLV_REDIRECT_ADDRESS, 0)?.as_string(),
            cookie: Cookie::new(tlvs.require(TLV_REDIRECT_COOKIE, 0)?.value().to_vec()),
        })
    }
}

/// Channel-1 or channel-2 message delivered to us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingIcbm {
    pub cookie: [u8; 8],
    pub channel: u16,
    pub sender: UserInfo,
    pub tlvs: TlvChain,
}

impl IncomingIcbm {
    /// Text and flags of a channel-1 message
    pub fn message(&self) -> Result<(MessageText, MessageFlags)> {
        let block = self.tlvs.require(im::TLV_MESSAGE_BLOCK, 0)?;
        let text = im::decode_message_block(block.value())?;
        let mut flags = MessageFlags::NONE;
        if self.tlvs.contains(im::TLV_AUTO_RESPONSE) {
            flags.insert(MessageFlags::AUTO_RESPONSE);
        }
        if self.tlvs.contains(im::TLV_ACK_REQUESTED) {
            flags.insert(MessageFlags::ACK_REQUESTED);
        }
        if self.tlvs.contains(im::TLV_STORE_OFFLINE) {
            flags.insert(MessageFlags::OFFLINE);
        }
        if text.charset == im::CHARSET_UNICODE {
            flags.insert(MessageFlags::UNICODE);
        }
        Ok((text, flags))
    }
}

/// Chat room message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatIncoming {
    pub sender: Option<UserInfo>,
    pub text: String,
}

/// ICBM channel parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcbmParams {
    pub channel: u16,
    pub flags: u32,
    pub max_message_len: u16,
    pub max_sender_warning: u16,
    pub max_receiver_warning: u16,
    pub min_interval: u32,
}

impl IcbmParams {
    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            channel: reader.read_u16()?,
            flags: reader.read_u32()?,
            max_message_len: reader.read_u16()?,
            max_sender_warning: reader.read_u16()?,
            max_receiver_warning: reader.read_u16()?,
            min_interval: reader.read_u32()?,
        })
    }
}

/// User info lookup reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateReply {
    pub user: UserInfo,
    pub profile: Option<String>,
    pub away_message: Option<String>,
}

// ----------------------------------------------------------------------------
// Inbound
// ----------------------------------------------------------------------------

/// A record decoded into the shape its handler expects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    AuthKey { key: Vec<u8> },
    AuthResult(AuthResult),
    /// Families the server offers on this connection
    ServerReady { families: Vec<u16> },
    VersionsAck { versions: Vec<(u16, u16)> },
    RateInfo(RateInfo),
    RateChange(RateChange),
    Redirect(Redirect),
    ServerPause { families: Vec<u16> },
    ServerResume,
    SelfInfo(UserInfo),
    Warned { new_level: u16, by: Option<UserInfo> },
    Motd { kind: u16, tlvs: TlvChain },
    VerifyRequest { offset: u32, length: u32 },
    ErrorReply { code: Option<u16> },
    Rights { tlvs: TlvChain },
    IcbmParams(IcbmParams),
    BuddyOnline(UserInfo),
    BuddyOffline(UserInfo),
    IncomingIcbm(IncomingIcbm),
    MessageAcked { channel: u16, to: String },
    LocateReply(LocateReply),
    SearchReply { names: Vec<String> },
    ChatNavInfo { rooms: Vec<RoomInfo> },
    ChatRoomInfo(RoomInfo),
    ChatUsersJoined(Vec<UserInfo>),
    ChatUsersLeft(Vec<UserInfo>),
    ChatIncoming(ChatIncoming),
    SsiList(SsiList),
    SsiUnchanged,
    SsiStatus { codes: Vec<u16> },
    SsiPush { op: SsiOp, items: Vec<SsiItem> },
    SsiEditBoundary,
    /// Pair the engine has no decoder for
    Unknown,
}

fn read_u16_list(reader: &mut ByteReader<'_>) -> Result<Vec<u16>> {
    let mut values = Vec::with_capacity(reader.remaining() / 2);
    while reader.remaining() >= 2 {
        values.push(reader.read_u16()?);
    }
    Ok(values)
}

fn read_user_list(reader: &mut ByteReader<'_>) -> Result<Vec<UserInfo>> {
    let mut users = Vec::new();
    while !reader.is_empty() {
        users.push(UserInfo::read(reader)?);
    }
    Ok(users)
}

fn read_cookie(reader: &mut ByteReader<'_>) -> Result<[u8; 8]> {
    let mut cookie = [0u8; 8];
    cookie.copy_from_slice(reader.read_bytes(8)?);
    Ok(cookie)
}

impl Inbound {
    /// Decode a record by its `(family, subtype)`
    pub fn decode(record: &Record) -> Result<Self> {
        let body = record.body()?;
        let mut reader = ByteReader::new(body, "record payload");
        let reader = &mut reader;

        let inbound = match (record.family, record.subtype) {
            (_, families::ERROR) => {
                let code = if reader.remaining() >= 2 {
                    Some(reader.read_u16()?)
                } else {
                    None
                };
                Inbound::ErrorReply { code }
            }

            (families::AUTH, auth_sub::KEY_REPLY) => Inbound::AuthKey {
                key: reader.read_u16_prefixed()?.to_vec(),
            },
            (families::AUTH, auth_sub::LOGIN_REPLY) => {
                Inbound::AuthResult(AuthResult::from_tlvs(&TlvChain::decode(reader.rest())?)?)
            }

            (families::GENERIC, generic::SERVER_READY) => Inbound::ServerReady {
                families: read_u16_list(reader)?,
            },
            (families::GENERIC, generic::VERSIONS_ACK) => {
                let mut versions = Vec::new();
                while reader.remaining() >= 4 {
                    versions.push((reader.read_u16()?, reader.read_u16()?));
                }
                Inbound::VersionsAck { versions }
            }
            (families::GENERIC, generic::RATE_INFO) => Inbound::RateInfo(RateInfo::decode(body)?),
            (families::GENERIC, generic::RATE_CHANGE) => {
                Inbound::RateChange(RateChange::decode(body)?)
            }
            (families::GENERIC, generic::REDIRECT) => {
                Inbound::Redirect(Redirect::from_tlvs(&TlvChain::decode(body)?)?)
            }
            (families::GENERIC, generic::SERVER_PAUSE) => Inbound::ServerPause {
                families: read_u16_list(reader)?,
            },
            (families::GENERIC, generic::SERVER_RESUME) => Inbound::ServerResume,
            (families::GENERIC, generic::SELF_INFO) => Inbound::SelfInfo(UserInfo::read(reader)?),
            (families::GENERIC, generic::WARNED) => {
                let new_level = reader.read_u16()?;
                let by = if reader.is_empty() {
                    None
                } else {
                    Some(UserInfo::read(reader)?)
                };
                Inbound::Warned { new_level, by }
            }
            (families::GENERIC, generic::MOTD) => Inbound::Motd {
                kind: reader.read_u16()?,
                tlvs: TlvChain::decode(reader.rest())?,
            },
            (families::GENERIC, generic::VERIFY_REQUEST) => Inbound::VerifyRequest {
                offset: reader.read_u32()?,
                length: reader.read_u32()?,
            },

            (families::LOCATE, locate::RIGHTS)
            | (families::BUDDY, buddy::RIGHTS)
            | (families::BOS, families::bos::RIGHTS)
            | (families::SSI, ssi::RIGHTS) => Inbound::Rights {
                tlvs: TlvChain::decode(body)?,
            },
            (families::ICBM, icbm::PARAMS) => Inbound::IcbmParams(IcbmParams::read(reader)?),

            (families::BUDDY, buddy::ONCOMING) => Inbound::BuddyOnline(UserInfo::read(reader)?),
            (families::BUDDY, buddy::OFFGOING) => Inbound::BuddyOffline(UserInfo::read(reader)?),

            (families::ICBM, icbm::INCOMING) => {
                let cookie = read_cookie(reader)?;
                let channel = reader.read_u16()?;
                let sender = UserInfo::read(reader)?;
                let tlvs = TlvChain::decode(reader.rest())?;
                Inbound::IncomingIcbm(IncomingIcbm {
                    cookie,
                    channel,
                    sender,
                    tlvs,
                })
            }
            (families::ICBM, icbm::HOST_ACK) => {
                read_cookie(reader)?;
                let channel = reader.read_u16()?;
                let to = String::from_utf8_lossy(reader.read_u8_prefixed()?).into_owned();
                Inbound::MessageAcked { channel, to }
            }

            (families::LOCATE, locate::INFO_REPLY) => {
                let user = UserInfo::read(reader)?;
                let tlvs = TlvChain::decode(reader.rest())?;
                Inbound::LocateReply(LocateReply {
                    user,
                    profile: tlvs.get_string(TLV_PROFILE, 0),
                    away_message: tlvs.get_string(TLV_AWAY_MESSAGE, 0),
                })
            }

            (families::USER_LOOKUP, lookup::SEARCH_REPLY) => {
                let tlvs = TlvChain::decode(body)?;
                Inbound::SearchReply {
                    names: tlvs.all(TLV_SEARCH_NAME).map(|tlv| tlv.as_string()).collect(),
                }
            }

            (families::CHAT_NAV, chat_nav::INFO) => {
                let tlvs = TlvChain::decode(body)?;
                let rooms = tlvs
                    .all(TLV_ROOM_INFO)
                    .map(|tlv| RoomInfo::decode(tlv.value()))
                    .collect::<Result<Vec<_>>>()?;
                Inbound::ChatNavInfo { rooms }
            }

            (families::CHAT, chat::ROOM_INFO) => Inbound::ChatRoomInfo(RoomInfo::read(reader)?),
            (families::CHAT, chat::USERS_JOINED) => Inbound::ChatUsersJoined(read_user_list(reader)?),
            (families::CHAT, chat::USERS_LEFT) => Inbound::ChatUsersLeft(read_user_list(reader)?),
            (families::CHAT, chat::INCOMING) => {
                read_cookie(reader)?;
                let _channel = reader.read_u16()?;
                let tlvs = TlvChain::decode(reader.rest())?;
                let sender = tlvs
                    .get(TLV_CHAT_SENDER, 0)
                    .map(|tlv| UserInfo::decode(tlv.value()))
                    .transpose()?;
                let info = TlvChain::decode(tlvs.require(TLV_CHAT_MESSAGE_INFO, 0)?.value())?;
                let text = info.get_string(TLV_CHAT_TEXT, 0).unwrap_or_default();
                Inbound::ChatIncoming(ChatIncoming { sender, text })
            }

            (families::SSI, ssi::LIST) => Inbound::SsiList(SsiList::decode(body)?),
            (families::SSI, ssi::UNCHANGED) => Inbound::SsiUnchanged,
            (families::SSI, ssi::STATUS) => Inbound::SsiStatus {
                codes: read_u16_list(reader)?,
            },
            (families::SSI, ssi::ADD) => Inbound::SsiPush {
                op: SsiOp::Add,
                items: decode_items(body)?,
            },
            (families::SSI, ssi::MODIFY) => Inbound::SsiPush {
                op: SsiOp::Modify,
                items: decode_items(body)?,
            },
            (families::SSI, ssi::DELETE) => Inbound::SsiPush {
                op: SsiOp::Delete,
                items: decode_items(body)?,
            },
            (families::SSI, ssi::EDIT_START) | (families::SSI, ssi::EDIT_END) => {
                Inbound::SsiEditBoundary
            }

            _ => Inbound::Unknown,
        };
        Ok(inbound)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Inbound::Unknown)
    }
}

/// Reason carried by a server close frame, if any
pub fn close_reason(payload: &[u8]) -> Option<u16> {
    TlvChain::decode(payload)
        .ok()?
        .get_u16(auth::TLV_DISCONNECT_REASON, 0)
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tlv::Tlv;
    use crate::protocol::WireWrite;

    #[test]
    fn test_auth_failure() {
        let tlvs = TlvChain::new()
            .with(Tlv::string(auth::TLV_SCREEN_NAME, "alice").unwrap())
            .with(Tlv::u16(auth::TLV_ERROR_CODE, 0x0005))
            .with(Tlv::string(auth::TLV_ERROR_URL, "http://help").unwrap());
        let record = Record::new(families::AUTH, auth_sub::LOGIN_REPLY, tlvs.encode());
        assert_eq!(
            Inbound::decode(&record).unwrap(),
            Inbound::AuthResult(AuthResult::Failure {
                code: 5,
                url: Some("http://help".into())
            })
        );
    }

    #[test]
    fn test_auth_success_requires_cookie() {
        let tlvs = TlvChain::new().with(Tlv::string(auth::TLV_BOS_ADDRESS, "bos:5190").unwrap());
        let record = Record::new(families::AUTH, auth_sub::LOGIN_REPLY, tlvs.encode());
        assert!(Inbound::decode(&record).is_err());
    }

    #[test]
    fn test_redirect() {
        let tlvs = TlvChain::new()
            .with(Tlv::u16(TLV_REDIRECT_FAMILY, families::CHAT))
            .with(Tlv::string(TLV_REDIRECT_ADDRESS, "chat:5190").unwrap())
            .with(Tlv::new(TLV_REDIRECT_COOKIE, b"K".to_vec()).unwrap());
        let record = Record::new(families::GENERIC, generic::REDIRECT, tlvs.encode());
        match Inbound::decode(&record).unwrap() {
            Inbound::Redirect(redirect) => {
                assert_eq!(redirect.family, families::CHAT);
                assert_eq!(redirect.address, "chat:5190");
                assert_eq!(redirect.cookie.as_bytes(), b"K");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_incoming_im() {
        let mut payload = vec![1, 2, 3, 4, 5, 6, 7, 8];
        payload.put_u16(im::CHANNEL_IM);
        payload.extend(UserInfo::new("bob", 0).encode().unwrap());
        let tlvs = TlvChain::new()
            .with(Tlv::new(im::TLV_MESSAGE_BLOCK, im::encode_message_block("hey").unwrap()).unwrap())
            .with(Tlv::empty(im::TLV_AUTO_RESPONSE));
        payload.extend(tlvs.encode());
        let record = Record::new(families::ICBM, icbm::INCOMING, payload);

        let Inbound::IncomingIcbm(message) = Inbound::decode(&record).unwrap() else {
            panic!("expected incoming IM");
        };
        assert_eq!(message.sender.screen_name, "bob");
        let (text, flags) = message.message().unwrap();
        assert_eq!(text.text, "hey");
        assert!(flags.contains(MessageFlags::AUTO_RESPONSE));
    }

    #[test]
    fn test_warned_anonymous() {
        let record = Record::new(families::GENERIC, generic::WARNED, vec![0x00, 0x64]);
        assert_eq!(
            Inbound::decode(&record).unwrap(),
            Inbound::Warned {
                new_level: 100,
                by: None
            }
        );
    }

    #[test]
    fn test_search_reply_names() {
        let tlvs = TlvChain::new()
            .with(Tlv::string(TLV_SEARCH_NAME, "one").unwrap())
            .with(Tlv::string(TLV_SEARCH_NAME, "two").unwrap());
        let record = Record::new(families::USER_LOOKUP, lookup::SEARCH_REPLY, tlvs.encode());
        assert_eq!(
            Inbound::decode(&record).unwrap(),
            Inbound::SearchReply {
                names: vec!["one".into(), "two".into()]
            }
        );
    }

    #[test]
    fn test_unknown_pair() {
        let record = Record::new(0x0099, 0x0042, vec![1, 2, 3]);
        assert!(Inbound::decode(&record).unwrap().is_unknown());
    }

    #[test]
    fn test_error_reply() {
        let record = Record::new(families::USER_LOOKUP, families::ERROR, vec![0x00, 0x14]);
        assert_eq!(
            Inbound::decode(&record).unwrap(),
            Inbound::ErrorReply { code: Some(0x14) }
        );
    }

    #[test]
    fn test_chat_incoming() {
        let mut payload = vec![0; 8];
        payload.put_u16(im::CHANNEL_CHAT);
        let info = TlvChain::new().with(Tlv::string(TLV_CHAT_TEXT, "hello room").unwrap());
        let tlvs = TlvChain::new()
            .with(Tlv::new(TLV_CHAT_SENDER, UserInfo::new("carol", 0).encode().unwrap()).unwrap())
            .with(Tlv::new(TLV_CHAT_MESSAGE_INFO, info.encode()).unwrap());
        payload.extend(tlvs.encode());
        let record = Record::new(families::CHAT, chat::INCOMING, payload);
        let Inbound::ChatIncoming(message) = Inbound::decode(&record).unwrap() else {
            panic!("expected chat message");
        };
        assert_eq!(message.sender.unwrap().screen_name, "carol");
        assert_eq!(message.text, "hello room");
    }

    #[test]
    fn test_close_reason() {
        let tlvs = TlvChain::new().with(Tlv::u16(auth::TLV_DISCONNECT_REASON, 1));
        assert_eq!(close_reason(&tlvs.encode()), Some(1));
        assert_eq!(close_reason(&[]), None);
    }
}
