//! Shared test harness: an engine on the in-memory network plus builders
//! for the records a server would send.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use owlchat_core::protocol::auth;
use owlchat_core::protocol::chat::{RoomInfo, RoomKey, TLV_ROOM_INFO, TLV_ROOM_NAME};
use owlchat_core::protocol::families::{self, buddy, chat, chat_nav, generic, icbm, ssi};
use owlchat_core::protocol::icbm::{encode_message_block, TLV_MESSAGE_BLOCK};
use owlchat_core::protocol::inbound::{
    TLV_CHAT_MESSAGE_INFO, TLV_CHAT_SENDER, TLV_CHAT_TEXT, TLV_REDIRECT_ADDRESS,
    TLV_REDIRECT_COOKIE, TLV_REDIRECT_FAMILY,
};
use owlchat_core::protocol::ssi::SsiList;
use owlchat_core::protocol::userinfo::TLV_IDLE_MINUTES;
use owlchat_core::protocol::{Channel, Frame, SsiItem, Tlv, TlvChain, UserInfo, WireWrite};
use owlchat_core::{
    ConnectionKind, EngineConfig, Notification, RateChange, RateClass, RateCode, RateInfo, Record,
    Timestamp,
};
use owlchat_runtime::{Engine, ManualTimeSource, MemoryEndpoint, MemoryNetwork};

pub const SCREEN_NAME: &str = "alice";
pub const PASSWORD: &str = "secret";
pub const AUTH_KEY: &[u8] = b"3141592653";
pub const BOS_ADDRESS: &str = "bos.test:5190";
pub const MAIN_COOKIE: &[u8] = b"main-cookie-0001";
pub const CHAT_NAV_ADDRESS: &str = "chatnav.test:5190";
pub const CHAT_ADDRESS: &str = "chat.test:5190";

pub const MAIN_FAMILIES: &[u16] = &[
    families::GENERIC,
    families::LOCATE,
    families::BUDDY,
    families::ICBM,
    families::BOS,
    families::SSI,
];

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

pub struct Harness {
    pub engine: Engine,
    pub network: MemoryNetwork,
    pub clock: ManualTimeSource,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::testing())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let network = MemoryNetwork::new();
        let clock = ManualTimeSource::new();
        let engine = Engine::with_parts(config, Box::new(network.connector()), Rc::new(clock.clone()))
            .expect("engine");
        Self {
            engine,
            network,
            clock,
        }
    }

    /// One non-blocking engine iteration
    pub fn step(&mut self) {
        self.engine.run_once(Some(Duration::ZERO)).expect("run_once");
    }

    pub fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        self.step();
    }

    pub fn now(&self) -> Timestamp {
        self.engine.session().now()
    }

    pub fn endpoint(&self, kind: ConnectionKind) -> MemoryEndpoint {
        self.network
            .last(kind)
            .unwrap_or_else(|| panic!("no {} endpoint", kind))
    }

    /// Deliver `record` on the latest `kind` endpoint and run one iteration
    pub fn push(&mut self, kind: ConnectionKind, record: Record) {
        self.endpoint(kind).push_record(&record).expect("push");
        self.step();
    }

    pub fn push_frame(&mut self, kind: ConnectionKind, frame: Frame) {
        self.endpoint(kind).push_frame(&frame);
        self.step();
    }

    pub fn notifications(&mut self) -> Vec<Notification> {
        self.engine.drain_notifications()
    }

    /// Walk the authorizer exchange up to the point the main connection opens
    pub fn authorize(&mut self) {
        self.engine.login(SCREEN_NAME, PASSWORD).expect("login");
        self.step();
        self.endpoint(ConnectionKind::Auth).take_frames();
        self.push(ConnectionKind::Auth, key_reply(AUTH_KEY));
        self.endpoint(ConnectionKind::Auth).take_frames();
        self.push(ConnectionKind::Auth, auth_success(BOS_ADDRESS, MAIN_COOKIE));
        self.step();
    }

    /// Server side of the generic service handshake on `kind`
    pub fn bring_online(&mut self, kind: ConnectionKind, offered: &[u16]) {
        self.push_frame(kind, Frame::control_hello(&TlvChain::new()).expect("hello"));
        self.push(kind, server_ready(offered));
        self.push(kind, versions_ack(offered));
        self.push(kind, rate_info());
    }

    /// Full login; returns the notifications it produced
    pub fn login(&mut self) -> Vec<Notification> {
        self.authorize();
        self.bring_online(ConnectionKind::Main, MAIN_FAMILIES);
        self.push(ConnectionKind::Main, ssi_list(Vec::new(), 0, false));
        self.endpoint(ConnectionKind::Main).take_frames();
        self.notifications()
    }

    /// Join `room` through a freshly redirected chat directory
    pub fn join_room(&mut self, room: &str) -> Vec<Notification> {
        self.engine.join_room(room, 4).expect("join_room");
        self.step();
        self.endpoint(ConnectionKind::Main).take_records();
        self.push(
            ConnectionKind::Main,
            redirect(families::CHAT_NAV, CHAT_NAV_ADDRESS, b"nav-cookie"),
        );
        self.step();
        self.bring_online(ConnectionKind::ChatDirectory, &[families::GENERIC, families::CHAT_NAV]);

        let create = self
            .endpoint(ConnectionKind::ChatDirectory)
            .take_records()
            .into_iter()
            .find(|record| record.key() == (families::CHAT_NAV, chat_nav::CREATE))
            .expect("room create request");
        self.push(
            ConnectionKind::ChatDirectory,
            chat_nav_info(room).with_request_id(create.request_id),
        );
        self.endpoint(ConnectionKind::Main).take_records();
        self.push(ConnectionKind::Main, redirect(families::CHAT, CHAT_ADDRESS, b"K"));
        self.step();
        self.notifications()
    }
}

// ----------------------------------------------------------------------------
// Server Records
// ----------------------------------------------------------------------------

pub fn key_reply(key: &[u8]) -> Record {
    let mut payload = Vec::new();
    payload.put_u16_prefixed(key);
    Record::new(families::AUTH, families::auth::KEY_REPLY, payload)
}

pub fn auth_success(address: &str, cookie: &[u8]) -> Record {
    let tlvs = TlvChain::new()
        .with(Tlv::string(auth::TLV_SCREEN_NAME, "Alice").unwrap())
        .with(Tlv::string(auth::TLV_BOS_ADDRESS, address).unwrap())
        .with(Tlv::new(auth::TLV_COOKIE, cookie.to_vec()).unwrap());
    Record::new(families::AUTH, families::auth::LOGIN_REPLY, tlvs.encode())
}

pub fn auth_failure_tlvs(code: u16) -> TlvChain {
    TlvChain::new()
        .with(Tlv::string(auth::TLV_SCREEN_NAME, SCREEN_NAME).unwrap())
        .with(Tlv::u16(auth::TLV_ERROR_CODE, code))
        .with(Tlv::string(auth::TLV_ERROR_URL, "http://help.test/").unwrap())
}

pub fn auth_failure(code: u16) -> Record {
    Record::new(
        families::AUTH,
        families::auth::LOGIN_REPLY,
        auth_failure_tlvs(code).encode(),
    )
}

pub fn server_ready(offered: &[u16]) -> Record {
    let mut payload = Vec::new();
    for family in offered {
        payload.put_u16(*family);
    }
    Record::new(families::GENERIC, generic::SERVER_READY, payload)
}

pub fn versions_ack(offered: &[u16]) -> Record {
    let mut payload = Vec::new();
    for family in offered {
        payload.put_u16(*family);
        payload.put_u16(families::family_version(*family));
    }
    Record::new(families::GENERIC, generic::VERSIONS_ACK, payload)
}

pub fn rate_class(id: u16, current_avg: u32) -> RateClass {
    RateClass {
        id,
        window: 4,
        clear_level: 2500,
        alert_level: 2000,
        limit_level: 1500,
        disconnect_level: 800,
        current_avg,
        max_avg: 6000,
        last_time: Some(0),
        state: Some(0),
    }
}

pub fn rate_info() -> Record {
    let mut groups = BTreeMap::new();
    groups.insert(1, vec![(families::ICBM, icbm::SEND), (families::CHAT, chat::SEND)]);
    let info = RateInfo {
        classes: vec![rate_class(1, 4000)],
        groups,
    };
    Record::new(families::GENERIC, generic::RATE_INFO, info.encode())
}

pub fn rate_change(code: RateCode, current_avg: u32) -> Record {
    let change = RateChange {
        code,
        class: rate_class(1, current_avg),
    };
    Record::new(families::GENERIC, generic::RATE_CHANGE, change.encode())
}

pub fn ssi_list(items: Vec<SsiItem>, last_modified: u32, more: bool) -> Record {
    let list = SsiList {
        version: 0,
        items,
        last_modified,
    };
    let record = Record::new(families::SSI, ssi::LIST, list.encode().unwrap());
    if more {
        record.with_flags(owlchat_core::protocol::record::FLAG_MORE_REPLIES)
    } else {
        record
    }
}

pub fn redirect(family: u16, address: &str, cookie: &[u8]) -> Record {
    let tlvs = TlvChain::new()
        .with(Tlv::u16(TLV_REDIRECT_FAMILY, family))
        .with(Tlv::string(TLV_REDIRECT_ADDRESS, address).unwrap())
        .with(Tlv::new(TLV_REDIRECT_COOKIE, cookie.to_vec()).unwrap());
    Record::new(families::GENERIC, generic::REDIRECT, tlvs.encode())
}

pub fn user(name: &str, idle_minutes: Option<u16>) -> UserInfo {
    let mut info = UserInfo::new(name, 0);
    if let Some(minutes) = idle_minutes {
        info.tlvs.push(Tlv::u16(TLV_IDLE_MINUTES, minutes));
    }
    info
}

pub fn buddy_online(name: &str, idle_minutes: Option<u16>) -> Record {
    Record::new(
        families::BUDDY,
        buddy::ONCOMING,
        user(name, idle_minutes).encode().unwrap(),
    )
}

pub fn buddy_offline(name: &str) -> Record {
    Record::new(families::BUDDY, buddy::OFFGOING, user(name, None).encode().unwrap())
}

pub fn incoming_im(from: &str, block: Vec<u8>) -> Record {
    let mut payload = vec![1, 2, 3, 4, 5, 6, 7, 8];
    payload.put_u16(owlchat_core::protocol::icbm::CHANNEL_IM);
    payload.extend_from_slice(&user(from, None).encode().unwrap());
    let tlvs = TlvChain::new().with(Tlv::new(TLV_MESSAGE_BLOCK, block).unwrap());
    payload.extend_from_slice(&tlvs.encode());
    Record::new(families::ICBM, icbm::INCOMING, payload)
}

pub fn incoming_text(from: &str, text: &str) -> Record {
    incoming_im(from, encode_message_block(text).unwrap())
}

pub fn warned(new_level: u16, by: Option<&str>) -> Record {
    let mut payload = Vec::new();
    payload.put_u16(new_level);
    if let Some(name) = by {
        payload.extend_from_slice(&user(name, None).encode().unwrap());
    }
    Record::new(families::GENERIC, generic::WARNED, payload)
}

pub fn room(name: &str) -> RoomInfo {
    RoomInfo {
        key: RoomKey {
            exchange: 4,
            cookie: format!("!aol://2719:10-4-{}", name).into_bytes(),
            instance: 0,
        },
        detail: 2,
        tlvs: TlvChain::new().with(Tlv::string(TLV_ROOM_NAME, name).unwrap()),
    }
}

pub fn chat_nav_info(name: &str) -> Record {
    let tlvs = TlvChain::new().with(Tlv::new(TLV_ROOM_INFO, room(name).encode().unwrap()).unwrap());
    Record::new(families::CHAT_NAV, chat_nav::INFO, tlvs.encode())
}

pub fn room_info(name: &str) -> Record {
    Record::new(families::CHAT, chat::ROOM_INFO, room(name).encode().unwrap())
}

pub fn chat_users(subtype: u16, names: &[&str]) -> Record {
    let mut payload = Vec::new();
    for name in names {
        payload.extend_from_slice(&user(name, None).encode().unwrap());
    }
    Record::new(families::CHAT, subtype, payload)
}

pub fn chat_incoming(from: &str, text: &str) -> Record {
    let mut payload = vec![0; 8];
    payload.put_u16(owlchat_core::protocol::icbm::CHANNEL_CHAT);
    let info = TlvChain::new().with(Tlv::string(TLV_CHAT_TEXT, text).unwrap());
    let tlvs = TlvChain::new()
        .with(Tlv::new(TLV_CHAT_SENDER, user(from, None).encode().unwrap()).unwrap())
        .with(Tlv::new(TLV_CHAT_MESSAGE_INFO, info.encode()).unwrap());
    payload.extend_from_slice(&tlvs.encode());
    Record::new(families::CHAT, chat::INCOMING, payload)
}

pub fn close_frame(tlvs: &TlvChain) -> Frame {
    Frame::new(Channel::Close, tlvs.encode()).unwrap()
}

/// Records of `(family, subtype)` among `records`
pub fn with_key(records: &[Record], family: u16, subtype: u16) -> Vec<Record> {
    records
        .iter()
        .filter(|record| record.key() == (family, subtype))
        .cloned()
        .collect()
}
