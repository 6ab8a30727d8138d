//! Keyed request/reply matching
//!
//! Requests that expect a reply register a continuation under their
//! request id. A reply on the same connection with the same id and family
//! resolves it; otherwise it resolves with a timeout or a closed-connection
//! error. Every continuation runs exactly once.

use std::collections::BTreeMap;
use std::fmt;

use owlchat_core::{Inbound, Record, RegistryError, Result, Timestamp};

use crate::connection::ConnId;
use crate::session::Session;

/// Matched reply handed to a continuation
#[derive(Debug, Clone)]
pub struct Reply {
    pub record: Record,
    pub inbound: Inbound,
}

/// Runs once with the reply or the reason there will be none
pub type Continuation = Box<dyn FnOnce(&mut Session, Result<Reply>) -> Result<()>>;

/// One outstanding keyed request
pub struct PendingRequest {
    pub conn: ConnId,
    pub request_id: u32,
    pub family: u16,
    pub subtype: u16,
    pub expires_at: Timestamp,
    pub continuation: Continuation,
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("conn", &self.conn)
            .field("request_id", &self.request_id)
            .field("family", &format_args!("0x{:04x}", self.family))
            .field("subtype", &format_args!("0x{:04x}", self.subtype))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl PendingRequest {
    /// Short label for logs and timeout errors
    pub fn describe(&self) -> String {
        format!(
            "reply to 0x{:04x}/0x{:04x} (request {})",
            self.family, self.subtype, self.request_id
        )
    }
}

/// Outstanding requests keyed by request id
#[derive(Debug, Default)]
pub struct PendingTable {
    requests: BTreeMap<u32, PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: PendingRequest) -> core::result::Result<(), RegistryError> {
        if self.requests.contains_key(&request.request_id) {
            return Err(RegistryError::DuplicateRequest {
                request_id: request.request_id,
            });
        }
        self.requests.insert(request.request_id, request);
        Ok(())
    }

    pub fn contains(&self, request_id: u32) -> bool {
        self.requests.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Remove the request a reply answers, if it matches connection and family
    pub fn take_match(&mut self, conn: ConnId, request_id: u32, family: u16) -> Option<PendingRequest> {
        let matches = self
            .requests
            .get(&request_id)
            .is_some_and(|request| request.conn == conn && request.family == family);
        if matches {
            self.requests.remove(&request_id)
        } else {
            None
        }
    }

    /// Remove every request whose deadline is at or before `now`, oldest first
    pub fn take_expired(&mut self, now: Timestamp) -> Vec<PendingRequest> {
        let ids: Vec<u32> = self
            .requests
            .values()
            .filter(|request| request.expires_at <= now)
            .map(|request| request.request_id)
            .collect();
        let mut expired: Vec<PendingRequest> = ids
            .iter()
            .filter_map(|id| self.requests.remove(id))
            .collect();
        expired.sort_by_key(|request| (request.expires_at, request.request_id));
        expired
    }

    /// Remove every request issued on `conn`
    pub fn take_for_connection(&mut self, conn: ConnId) -> Vec<PendingRequest> {
        let ids: Vec<u32> = self
            .requests
            .values()
            .filter(|request| request.conn == conn)
            .map(|request| request.request_id)
            .collect();
        ids.iter()
            .filter_map(|id| self.requests.remove(id))
            .collect()
    }

    pub fn take_all(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.requests).into_values().collect()
    }

    /// Earliest deadline among outstanding requests
    pub fn next_expiry(&self) -> Option<Timestamp> {
        self.requests.values().map(|request| request.expires_at).min()
    }
}
