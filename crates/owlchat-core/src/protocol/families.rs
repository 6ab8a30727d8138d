//! Service families and record subtypes
//!
//! The `(family, subtype)` pair is the wire discriminant of every data
//! record; these constants name the pairs the engine sends or handles.

pub const GENERIC: u16 = 0x0001;
pub const LOCATE: u16 = 0x0002;
pub const BUDDY: u16 = 0x0003;
pub const ICBM: u16 = 0x0004;
pub const INVITE: u16 = 0x0006;
pub const ADMIN: u16 = 0x0007;
pub const POPUP: u16 = 0x0008;
pub const BOS: u16 = 0x0009;
pub const USER_LOOKUP: u16 = 0x000a;
pub const STATS: u16 = 0x000b;
pub const CHAT_NAV: u16 = 0x000d;
pub const CHAT: u16 = 0x000e;
pub const ICON: u16 = 0x0010;
pub const SSI: u16 = 0x0013;
pub const AUTH: u16 = 0x0017;
pub const MAIL: u16 = 0x0018;

/// Subtype shared by every family for error replies
pub const ERROR: u16 = 0x0001;

pub mod generic {
    pub const CLIENT_READY: u16 = 0x0002;
    pub const SERVER_READY: u16 = 0x0003;
    pub const SERVICE_REQUEST: u16 = 0x0004;
    pub const REDIRECT: u16 = 0x0005;
    pub const RATE_REQUEST: u16 = 0x0006;
    pub const RATE_INFO: u16 = 0x0007;
    pub const RATE_ACK: u16 = 0x0008;
    pub const RATE_CHANGE: u16 = 0x000a;
    pub const SERVER_PAUSE: u16 = 0x000b;
    pub const PAUSE_ACK: u16 = 0x000c;
    pub const SERVER_RESUME: u16 = 0x000d;
    pub const SELF_INFO_REQUEST: u16 = 0x000e;
    pub const SELF_INFO: u16 = 0x000f;
    pub const WARNED: u16 = 0x0010;
    pub const MOTD: u16 = 0x0013;
    pub const VERSIONS: u16 = 0x0017;
    pub const VERSIONS_ACK: u16 = 0x0018;
    pub const VERIFY_REQUEST: u16 = 0x001f;
    pub const VERIFY_REPLY: u16 = 0x0020;
}

pub mod locate {
    pub const RIGHTS_REQUEST: u16 = 0x0002;
    pub const RIGHTS: u16 = 0x0003;
    pub const SET_INFO: u16 = 0x0004;
    pub const INFO_REQUEST: u16 = 0x0005;
    pub const INFO_REPLY: u16 = 0x0006;
}

pub mod buddy {
    pub const RIGHTS_REQUEST: u16 = 0x0002;
    pub const RIGHTS: u16 = 0x0003;
    pub const ONCOMING: u16 = 0x000b;
    pub const OFFGOING: u16 = 0x000c;
}

pub mod icbm {
    pub const SET_PARAMS: u16 = 0x0002;
    pub const PARAMS_REQUEST: u16 = 0x0004;
    pub const PARAMS: u16 = 0x0005;
    pub const SEND: u16 = 0x0006;
    pub const INCOMING: u16 = 0x0007;
    pub const MISSED: u16 = 0x000a;
    pub const HOST_ACK: u16 = 0x000c;
}

pub mod bos {
    pub const RIGHTS_REQUEST: u16 = 0x0002;
    pub const RIGHTS: u16 = 0x0003;
}

pub mod lookup {
    pub const SEARCH_EMAIL: u16 = 0x0002;
    pub const SEARCH_REPLY: u16 = 0x0003;
}

pub mod chat_nav {
    pub const RIGHTS_REQUEST: u16 = 0x0002;
    pub const CREATE: u16 = 0x0008;
    pub const INFO: u16 = 0x0009;
}

pub mod chat {
    pub const ROOM_INFO: u16 = 0x0002;
    pub const USERS_JOINED: u16 = 0x0003;
    pub const USERS_LEFT: u16 = 0x0004;
    pub const SEND: u16 = 0x0005;
    pub const INCOMING: u16 = 0x0006;
}

pub mod ssi {
    pub const RIGHTS_REQUEST: u16 = 0x0002;
    pub const RIGHTS: u16 = 0x0003;
    pub const LIST_REQUEST: u16 = 0x0005;
    pub const LIST: u16 = 0x0006;
    pub const ACTIVATE: u16 = 0x0007;
    pub const ADD: u16 = 0x0008;
    pub const MODIFY: u16 = 0x0009;
    pub const DELETE: u16 = 0x000a;
    pub const STATUS: u16 = 0x000e;
    pub const UNCHANGED: u16 = 0x000f;
    pub const EDIT_START: u16 = 0x0011;
    pub const EDIT_END: u16 = 0x0012;
}

pub mod auth {
    pub const LOGIN: u16 = 0x0002;
    pub const LOGIN_REPLY: u16 = 0x0003;
    pub const KEY_REQUEST: u16 = 0x0006;
    pub const KEY_REPLY: u16 = 0x0007;
}

/// Versions advertised in the family-versions exchange
pub const FAMILY_VERSIONS: &[(u16, u16)] = &[
    (GENERIC, 3),
    (LOCATE, 1),
    (BUDDY, 1),
    (ICBM, 1),
    (INVITE, 1),
    (POPUP, 1),
    (BOS, 1),
    (USER_LOOKUP, 1),
    (STATS, 1),
    (CHAT_NAV, 1),
    (CHAT, 1),
    (ICON, 1),
    (SSI, 3),
    (AUTH, 1),
    (MAIL, 1),
];

/// Version this client speaks for `family`
pub fn family_version(family: u16) -> u16 {
    FAMILY_VERSIONS
        .iter()
        .find(|(f, _)| *f == family)
        .map(|(_, v)| *v)
        .unwrap_or(1)
}

/// Tool identifier sent with every family in client-ready
pub const TOOL_ID: u16 = 0x0110;
/// Tool version sent with every family in client-ready
pub const TOOL_VERSION: u16 = 0x047b;
