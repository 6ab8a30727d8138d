//! owlchat core
//!
//! Foundational types for the owlchat IM-protocol engine: the binary
//! frame/record/TLV codec, typed inbound records and outbound builders,
//! the server rate-class model, configuration, the error taxonomy and the
//! notifications the engine emits. Nothing here performs I/O.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod events;
pub mod protocol;
pub mod rate;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{EngineConfig, ProxyConfig, ReconnectConfig, TimeoutConfig};
pub use errors::{
    AuthenticationError, LoginFailure, OwlchatError, OwlchatResult, ProtocolViolation,
    RegistryError, Result, StateTransitionError, TransportError,
};
pub use events::Notification;
pub use protocol::{
    decode_frame, encode_frame, decode_tlv_chain, encode_tlv_chain, Channel, Frame, FrameBuffer,
    FrameError, Inbound, Record, Tlv, TlvChain, UserInfo,
};
pub use rate::{RateChange, RateClass, RateCode, RateInfo, RatePolicy, RateReaction, RateTable};
pub use types::{
    normalize_screen_name, ConnectionKind, Cookie, MessageFlags, ScreenName, SystemTimeSource,
    TimeSource, Timestamp,
};
