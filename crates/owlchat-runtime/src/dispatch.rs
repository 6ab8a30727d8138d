//! Record and connection-event dispatch
//!
//! Each connection carries a [`HandlerTable`] mapping `(family, subtype)`
//! pairs and connection events to handlers. Dispatch of one record tries,
//! in order: the pending request it answers, the exact handler, the
//! connection's catch-all, and finally counts it as unhandled. Handlers are
//! reference-counted and cloned out of the table before they run, so a
//! handler may freely mutate the session, including the table it came
//! from. A panicking handler is contained and reported as a protocol
//! violation on the connection.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use owlchat_core::{Inbound, ProtocolViolation, Record, RegistryError, Result};
use tracing::{debug, trace};

use crate::connection::ConnId;
use crate::pending::Reply;
use crate::session::Session;

/// Payload bytes shown when logging an unhandled record
const UNHANDLED_PREVIEW: usize = 32;

// ----------------------------------------------------------------------------
// Handler Types
// ----------------------------------------------------------------------------

/// Handler for one decoded record
pub type RecordHandler = Rc<dyn Fn(&mut Session, ConnId, &Record, &Inbound) -> Result<()>>;

/// Handler for a connection lifecycle event
pub type EventHandler = Rc<dyn Fn(&mut Session, ConnId, &ConnectionEvent) -> Result<()>>;

/// Connection lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectComplete,
    ConnectError { reason: String },
    /// Server hello received on the control channel
    VersionNegotiated { version: u32 },
}

/// Table key for a [`ConnectionEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    ConnectComplete,
    ConnectError,
    VersionNegotiated,
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::ConnectComplete => EventKind::ConnectComplete,
            ConnectionEvent::ConnectError { .. } => EventKind::ConnectError,
            ConnectionEvent::VersionNegotiated { .. } => EventKind::VersionNegotiated,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::ConnectComplete => "connect-complete",
            EventKind::ConnectError => "connect-error",
            EventKind::VersionNegotiated => "version-negotiated",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Handler Table
// ----------------------------------------------------------------------------

/// Per-connection handler registry
#[derive(Default)]
pub struct HandlerTable {
    records: BTreeMap<(u16, u16), RecordHandler>,
    events: BTreeMap<EventKind, EventHandler>,
    catch_all: Option<RecordHandler>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("records", &self.records.keys().collect::<Vec<_>>())
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .field("catch_all", &self.catch_all.is_some())
            .finish()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `(family, subtype)`; pairs register once
    pub fn register<F>(
        &mut self,
        family: u16,
        subtype: u16,
        handler: F,
    ) -> core::result::Result<(), RegistryError>
    where
        F: Fn(&mut Session, ConnId, &Record, &Inbound) -> Result<()> + 'static,
    {
        if self.records.contains_key(&(family, subtype)) {
            return Err(RegistryError::DuplicateHandler { family, subtype });
        }
        self.records.insert((family, subtype), Rc::new(handler));
        Ok(())
    }

    /// Register the handler for a connection event kind
    pub fn register_event<F>(
        &mut self,
        kind: EventKind,
        handler: F,
    ) -> core::result::Result<(), RegistryError>
    where
        F: Fn(&mut Session, ConnId, &ConnectionEvent) -> Result<()> + 'static,
    {
        if self.events.contains_key(&kind) {
            return Err(RegistryError::DuplicateEventHandler {
                event: kind.to_string(),
            });
        }
        self.events.insert(kind, Rc::new(handler));
        Ok(())
    }

    /// Register the fallback for records with no exact handler
    pub fn set_catch_all<F>(&mut self, handler: F) -> core::result::Result<(), RegistryError>
    where
        F: Fn(&mut Session, ConnId, &Record, &Inbound) -> Result<()> + 'static,
    {
        if self.catch_all.is_some() {
            return Err(RegistryError::DuplicateCatchAll);
        }
        self.catch_all = Some(Rc::new(handler));
        Ok(())
    }

    pub fn handler(&self, family: u16, subtype: u16) -> Option<RecordHandler> {
        self.records.get(&(family, subtype)).cloned()
    }

    pub fn event_handler(&self, kind: EventKind) -> Option<EventHandler> {
        self.events.get(&kind).cloned()
    }

    pub fn catch_all(&self) -> Option<RecordHandler> {
        self.catch_all.clone()
    }

    pub fn contains(&self, family: u16, subtype: u16) -> bool {
        self.records.contains_key(&(family, subtype))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.events.is_empty() && self.catch_all.is_none()
    }
}

// ----------------------------------------------------------------------------
// Dispatch
// ----------------------------------------------------------------------------

/// Where a record ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Pending,
    Handler,
    CatchAll,
    Unhandled,
}

/// Run `body`, turning a panic into a protocol violation for `record`
fn contain<F>(family: u16, subtype: u16, body: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(_) => Err(ProtocolViolation::HandlerPanic { family, subtype }.into()),
    }
}

/// Route one record received on `conn`
pub fn dispatch_record(session: &mut Session, conn: ConnId, record: &Record) -> Result<Dispatched> {
    let inbound = Inbound::decode(record)?;
    let (family, subtype) = record.key();

    if record.request_id != 0 {
        if let Some(pending) = session
            .pending_mut()
            .take_match(conn, record.request_id, family)
        {
            trace!("{} resolved {}", conn, pending.describe());
            let reply = Reply {
                record: record.clone(),
                inbound,
            };
            let continuation = pending.continuation;
            contain(family, subtype, || continuation(session, Ok(reply)))?;
            return Ok(Dispatched::Pending);
        }
    }

    let (handler, catch_all) = match session.connection(conn) {
        Some(connection) => (
            connection.handlers.handler(family, subtype),
            connection.handlers.catch_all(),
        ),
        None => (None, None),
    };

    if let Some(handler) = handler {
        contain(family, subtype, || handler(session, conn, record, &inbound))?;
        return Ok(Dispatched::Handler);
    }
    if let Some(handler) = catch_all {
        contain(family, subtype, || handler(session, conn, record, &inbound))?;
        return Ok(Dispatched::CatchAll);
    }

    session.stats_mut().unhandled_records += 1;
    let preview = &record.payload[..record.payload.len().min(UNHANDLED_PREVIEW)];
    debug!(
        "Unhandled record 0x{:04x}/0x{:04x} on {}: {}",
        family,
        subtype,
        conn,
        hex::encode(preview)
    );
    Ok(Dispatched::Unhandled)
}

/// Deliver a connection event to the connection's handler, if any
pub fn dispatch_event(session: &mut Session, conn: ConnId, event: ConnectionEvent) -> Result<()> {
    let handler = session
        .connection(conn)
        .and_then(|connection| connection.handlers.event_handler(event.kind()));
    match handler {
        Some(handler) => contain(0, 0, || handler(session, conn, &event)),
        None => {
            trace!("No handler for {} on {}", event.kind(), conn);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Session, _: ConnId, _: &Record, _: &Inbound) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut table = HandlerTable::new();
        table.register(0x0004, 0x0007, noop).unwrap();
        assert_eq!(
            table.register(0x0004, 0x0007, noop).unwrap_err(),
            RegistryError::DuplicateHandler {
                family: 0x0004,
                subtype: 0x0007
            }
        );
        assert!(table.contains(0x0004, 0x0007));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_duplicate_event_and_catch_all_rejected() {
        let mut table = HandlerTable::new();
        let on_connect = |_: &mut Session, _: ConnId, _: &ConnectionEvent| -> Result<()> { Ok(()) };
        table
            .register_event(EventKind::ConnectComplete, on_connect)
            .unwrap();
        assert!(table
            .register_event(EventKind::ConnectComplete, on_connect)
            .is_err());

        table.set_catch_all(noop).unwrap();
        assert_eq!(
            table.set_catch_all(noop).unwrap_err(),
            RegistryError::DuplicateCatchAll
        );
    }

    #[test]
    fn test_panic_is_contained() {
        let result = contain(0x0004, 0x0007, || panic!("handler bug"));
        assert!(matches!(
            result,
            Err(owlchat_core::OwlchatError::Protocol(
                ProtocolViolation::HandlerPanic {
                    family: 0x0004,
                    subtype: 0x0007
                }
            ))
        ));
    }

    #[test]
    fn test_event_kinds() {
        assert_eq!(
            ConnectionEvent::ConnectError {
                reason: "refused".into()
            }
            .kind(),
            EventKind::ConnectError
        );
        assert_eq!(EventKind::VersionNegotiated.to_string(), "version-negotiated");
    }
}
