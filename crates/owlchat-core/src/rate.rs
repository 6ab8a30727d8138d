//! Server-driven rate classes
//!
//! The server assigns every record type to a rate class and periodically
//! reports each class's running average against its thresholds. The
//! client reacts by spacing out sends on the affected connection; sends
//! are delayed, never dropped. A breach of the disconnect threshold ends
//! the connection.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{OwlchatError, Result};
use crate::protocol::bytes::{ByteReader, WireWrite};

/// Size of a class entry without the trailing opaque fields
pub const RATE_CLASS_BASIC_SIZE: usize = 30;
/// Size of a class entry carrying last-time and state
pub const RATE_CLASS_EXTENDED_SIZE: usize = 35;

// ----------------------------------------------------------------------------
// Rate Policy
// ----------------------------------------------------------------------------

/// How rate-change codes translate into send spacing
///
/// The divisors are tuning values inherited from the reference client, not
/// protocol requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatePolicy {
    /// Warning code, or a change below the alert level, spaces sends by
    /// `window / warning_divisor` seconds
    pub warning_divisor: u32,
    /// Limit code spaces sends by `window / limit_divisor` seconds
    pub limit_divisor: u32,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            warning_divisor: 4,
            limit_divisor: 2,
        }
    }
}

impl RatePolicy {
    fn spacing(window: u32, divisor: u32) -> Duration {
        let millis = u64::from(window) * 1000 / u64::from(divisor.max(1));
        Duration::from_millis(millis)
    }

    /// Reaction to a rate-change notification for `class`
    pub fn react(&self, code: RateCode, class: &RateClass) -> RateReaction {
        if class.disconnect_level != 0 && class.current_avg <= class.disconnect_level {
            return RateReaction::Disconnect;
        }
        match code {
            RateCode::Changed if class.current_avg >= class.clear_level => RateReaction::Clear,
            RateCode::Changed if class.is_alerting() => {
                RateReaction::Throttle(Self::spacing(class.window, self.warning_divisor))
            }
            RateCode::Changed => RateReaction::Keep,
            RateCode::Warning => {
                RateReaction::Throttle(Self::spacing(class.window, self.warning_divisor))
            }
            RateCode::Limit => RateReaction::Throttle(Self::spacing(class.window, self.limit_divisor)),
            RateCode::Cleared => RateReaction::Clear,
            RateCode::Other(_) => RateReaction::Keep,
        }
    }
}

/// What the send path should do after a rate change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateReaction {
    /// Leave the current spacing as is
    Keep,
    /// Remove any spacing for this class
    Clear,
    /// Space sends on the connection by at least this much
    Throttle(Duration),
    /// Average fell to the disconnect level
    Disconnect,
}

// ----------------------------------------------------------------------------
// Rate Codes and Classes
// ----------------------------------------------------------------------------

/// Rate-change notification code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RateCode {
    Changed,
    Warning,
    Limit,
    Cleared,
    Other(u16),
}

impl RateCode {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => RateCode::Changed,
            2 => RateCode::Warning,
            3 => RateCode::Limit,
            4 => RateCode::Cleared,
            other => RateCode::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            RateCode::Changed => 1,
            RateCode::Warning => 2,
            RateCode::Limit => 3,
            RateCode::Cleared => 4,
            RateCode::Other(other) => *other,
        }
    }
}

/// One server-defined throttling bucket
///
/// `last_time` and `state` are carried only by the extended layout; their
/// meaning is not relied upon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateClass {
    pub id: u16,
    pub window: u32,
    pub clear_level: u32,
    pub alert_level: u32,
    pub limit_level: u32,
    pub disconnect_level: u32,
    pub current_avg: u32,
    pub max_avg: u32,
    pub last_time: Option<u32>,
    pub state: Option<u8>,
}

impl RateClass {
    pub fn read(reader: &mut ByteReader<'_>, extended: bool) -> Result<Self> {
        let mut class = RateClass {
            id: reader.read_u16()?,
            window: reader.read_u32()?,
            clear_level: reader.read_u32()?,
            alert_level: reader.read_u32()?,
            limit_level: reader.read_u32()?,
            disconnect_level: reader.read_u32()?,
            current_avg: reader.read_u32()?,
            max_avg: reader.read_u32()?,
            last_time: None,
            state: None,
        };
        if extended {
            class.last_time = Some(reader.read_u32()?);
            class.state = Some(reader.read_u8()?);
        }
        Ok(class)
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.put_u16(self.id);
        out.put_u32(self.window);
        out.put_u32(self.clear_level);
        out.put_u32(self.alert_level);
        out.put_u32(self.limit_level);
        out.put_u32(self.disconnect_level);
        out.put_u32(self.current_avg);
        out.put_u32(self.max_avg);
        if let (Some(last_time), Some(state)) = (self.last_time, self.state) {
            out.put_u32(last_time);
            out.put_u8(state);
        }
    }

    /// True once the average has dropped under the alert threshold
    pub fn is_alerting(&self) -> bool {
        self.current_avg < self.alert_level
    }
}

// ----------------------------------------------------------------------------
// Rate Info and Change Payloads
// ----------------------------------------------------------------------------

/// Contents of the rate-info reply: classes and the records each governs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateInfo {
    pub classes: Vec<RateClass>,
    pub groups: BTreeMap<u16, Vec<(u16, u16)>>,
}

impl RateInfo {
    /// Parse a rate-info payload, detecting the class entry layout
    ///
    /// Servers send either 30- or 35-byte class entries with no marker; the
    /// layout whose group section ends exactly at the end of the payload wins.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Self::decode_layout(payload, true).or_else(|extended_err| {
            debug!(error = %extended_err, "rate info is not extended layout, trying basic");
            Self::decode_layout(payload, false)
        })
    }

    fn decode_layout(payload: &[u8], extended: bool) -> Result<Self> {
        let mut reader = ByteReader::new(payload, "rate info");
        let count = reader.read_u16()? as usize;
        let mut info = RateInfo::default();
        for _ in 0..count {
            info.classes.push(RateClass::read(&mut reader, extended)?);
        }
        for _ in 0..count {
            let id = reader.read_u16()?;
            let pairs = reader.read_u16()? as usize;
            let mut members = Vec::with_capacity(pairs);
            for _ in 0..pairs {
                members.push((reader.read_u16()?, reader.read_u16()?));
            }
            info.groups.insert(id, members);
        }
        if !reader.is_empty() {
            return Err(OwlchatError::malformed(
                "rate info",
                format!("{} trailing bytes", reader.remaining()),
            ));
        }
        Ok(info)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u16(self.classes.len() as u16);
        for class in &self.classes {
            class.write(&mut out);
        }
        for class in &self.classes {
            let members = self.groups.get(&class.id).map(Vec::as_slice).unwrap_or(&[]);
            out.put_u16(class.id);
            out.put_u16(members.len() as u16);
            for (family, subtype) in members {
                out.put_u16(*family);
                out.put_u16(*subtype);
            }
        }
        out
    }

    pub fn class_ids(&self) -> Vec<u16> {
        self.classes.iter().map(|class| class.id).collect()
    }
}

/// Decoded rate-change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateChange {
    pub code: RateCode,
    pub class: RateClass,
}

impl RateChange {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(payload, "rate change");
        let code = RateCode::from_u16(reader.read_u16()?);
        let extended = reader.remaining() >= RATE_CLASS_EXTENDED_SIZE;
        let class = RateClass::read(&mut reader, extended)?;
        Ok(Self { code, class })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u16(self.code.as_u16());
        self.class.write(&mut out);
        out
    }
}

// ----------------------------------------------------------------------------
// Rate Table
// ----------------------------------------------------------------------------

/// Per-connection rate classes and the spacing each currently imposes
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    classes: BTreeMap<u16, RateClass>,
    groups: BTreeMap<(u16, u16), u16>,
    throttles: BTreeMap<u16, Duration>,
}

impl RateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table with a fresh rate-info reply
    pub fn load(&mut self, info: &RateInfo) {
        self.classes = info
            .classes
            .iter()
            .map(|class| (class.id, class.clone()))
            .collect();
        self.groups = info
            .groups
            .iter()
            .flat_map(|(id, members)| members.iter().map(move |key| (*key, *id)))
            .collect();
        self.throttles.clear();
    }

    pub fn get(&self, id: u16) -> Option<&RateClass> {
        self.classes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Class governing a `(family, subtype)` record
    pub fn class_for(&self, family: u16, subtype: u16) -> Option<u16> {
        self.groups.get(&(family, subtype)).copied()
    }

    /// Record a rate change and return the resulting reaction
    pub fn apply(&mut self, change: &RateChange, policy: &RatePolicy) -> RateReaction {
        let reaction = policy.react(change.code, &change.class);
        let id = change.class.id;
        self.classes.insert(id, change.class.clone());
        match reaction {
            RateReaction::Clear => {
                self.throttles.remove(&id);
            }
            RateReaction::Throttle(spacing) if spacing.is_zero() => {
                self.throttles.remove(&id);
            }
            RateReaction::Throttle(spacing) => {
                self.throttles.insert(id, spacing);
            }
            RateReaction::Keep | RateReaction::Disconnect => {}
        }
        reaction
    }

    pub fn throttle(&self, id: u16) -> Option<Duration> {
        self.throttles.get(&id).copied()
    }

    /// Minimum spacing between sends: the largest active class throttle
    pub fn min_send_interval(&self) -> Duration {
        self.throttles
            .values()
            .copied()
            .max()
            .unwrap_or(Duration::ZERO)
    }
}
