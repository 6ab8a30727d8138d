//! Wire protocol
//!
//! Pure, I/O-free codecs for the nested wire format:
//! - `frame`: the outer envelope and its resumable decoder
//! - `record`: the `(family, subtype)` record header
//! - `tlv`: tag-length-value chains
//! - `userinfo`: the user identity block
//! - `inbound` / `outbound`: typed decoding and request builders
//! - `auth`, `icbm`, `chat`, `ssi`: per-service payload structures

pub mod auth;
pub mod bytes;
pub mod chat;
pub mod families;
pub mod frame;
pub mod icbm;
pub mod inbound;
pub mod outbound;
pub mod record;
pub mod ssi;
pub mod tlv;
pub mod userinfo;

// Re-export codec entry points
pub use bytes::{ByteReader, WireWrite};
pub use frame::{decode_frame, encode_frame, Channel, Frame, FrameBuffer, FrameError};
pub use record::Record;
pub use tlv::{decode_tlv_chain, encode_tlv_chain, Tlv, TlvChain};
pub use userinfo::UserInfo;

// Re-export typed payloads
pub use auth::ClientIdentity;
pub use chat::{RoomInfo, RoomKey};
pub use inbound::{AuthResult, Inbound, IncomingIcbm, Redirect};
pub use ssi::{Feedbag, SsiEdit, SsiItem, SsiOp};
