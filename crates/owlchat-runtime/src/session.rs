//! Session
//!
//! The root owner for one logical login: every [`Connection`], the pending
//! request table, the login state machine, the buddy list mirror, chat
//! room state and the notification queue. Handlers, continuations and
//! timers all receive `&mut Session`; nothing else holds session state.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use owlchat_core::protocol::frame::{Channel, Frame};
use owlchat_core::protocol::{Feedbag, RoomKey};
use owlchat_core::{
    ConnectionKind, Cookie, EngineConfig, Notification, OwlchatError, Record, Result,
    StateTransitionError, TimeSource, Timestamp, TransportError, UserInfo,
};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{ConnId, ConnState, Connection, ServicePhase};
use crate::dispatch::{self, ConnectionEvent};
use crate::handshake;
use crate::login::{LoginEvent, LoginMachine, LoginState};
use crate::pending::{PendingRequest, PendingTable, Reply};
use crate::transport::Connector;

/// Largest request id; ids wrap back to 1
const MAX_REQUEST_ID: u32 = 0x7fff_ffff;

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

/// Counters describing what the session has done so far
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub connections_opened: u64,
    pub records_sent: u64,
    pub records_dispatched: u64,
    /// Records with no pending request, handler or catch-all
    pub unhandled_records: u64,
    pub handler_errors: u64,
    pub requests_timed_out: u64,
    pub notifications_emitted: u64,
}

/// Redirect asked of the main connection and not yet answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub kind: ConnectionKind,
    pub room: Option<RoomKey>,
    pub room_name: Option<String>,
}

/// Room the user asked to join, waiting for the chat directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomJoin {
    pub name: String,
    pub exchange: u16,
}

/// Chat rooms joined or being joined
#[derive(Debug, Default)]
pub struct ChatState {
    pub(crate) joins: VecDeque<RoomJoin>,
    pub(crate) rooms: BTreeMap<ConnId, String>,
    pub(crate) announced: BTreeSet<ConnId>,
}

impl ChatState {
    fn clear(&mut self) {
        self.joins.clear();
        self.rooms.clear();
        self.announced.clear();
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

pub struct Session {
    config: EngineConfig,
    clock: Rc<dyn TimeSource>,
    connector: Box<dyn Connector>,
    connections: BTreeMap<ConnId, Connection>,
    next_conn_id: u64,
    pending: PendingTable,
    next_request_id: u32,
    login: LoginMachine,
    screen_name: Option<String>,
    self_info: Option<UserInfo>,
    feedbag: Feedbag,
    service_requests: VecDeque<ServiceRequest>,
    chat: ChatState,
    notifications: VecDeque<Notification>,
    stats: SessionStats,
    client_binary: Option<Vec<u8>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("login_state", &self.login.state())
            .field("screen_name", &self.screen_name)
            .field("connections", &self.connections.len())
            .field("pending", &self.pending.len())
            .field("notifications", &self.notifications.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Session {
    pub fn new(
        config: EngineConfig,
        connector: Box<dyn Connector>,
        clock: Rc<dyn TimeSource>,
        client_binary: Option<Vec<u8>>,
    ) -> Self {
        Self {
            config,
            clock,
            connector,
            connections: BTreeMap::new(),
            next_conn_id: 1,
            pending: PendingTable::new(),
            next_request_id: 1,
            login: LoginMachine::new(),
            screen_name: None,
            self_info: None,
            feedbag: Feedbag::new(),
            service_requests: VecDeque::new(),
            chat: ChatState::default(),
            notifications: VecDeque::new(),
            stats: SessionStats::default(),
            client_binary,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn login_state(&self) -> LoginState {
        self.login.state()
    }

    pub fn login_machine(&self) -> &LoginMachine {
        &self.login
    }

    pub(crate) fn login_mut(&mut self) -> &mut LoginMachine {
        &mut self.login
    }

    /// Apply a login event, logging the transition
    pub(crate) fn apply_login(&mut self, event: LoginEvent) -> core::result::Result<LoginState, StateTransitionError> {
        let from = self.login.state();
        let now = self.now();
        let to = self.login.apply(event, now)?;
        info!("Login {} -> {}", from, to);
        Ok(to)
    }

    /// Screen name as the server formats it, once known
    pub fn screen_name(&self) -> Option<&str> {
        self.screen_name.as_deref()
    }

    pub(crate) fn set_screen_name(&mut self, name: String) {
        self.screen_name = Some(name);
    }

    pub fn self_info(&self) -> Option<&UserInfo> {
        self.self_info.as_ref()
    }

    pub(crate) fn set_self_info(&mut self, info: UserInfo) {
        self.self_info = Some(info);
    }

    pub fn feedbag(&self) -> &Feedbag {
        &self.feedbag
    }

    pub(crate) fn feedbag_mut(&mut self) -> &mut Feedbag {
        &mut self.feedbag
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut SessionStats {
        &mut self.stats
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub(crate) fn pending_mut(&mut self) -> &mut PendingTable {
        &mut self.pending
    }

    pub(crate) fn chat(&self) -> &ChatState {
        &self.chat
    }

    pub(crate) fn chat_mut(&mut self) -> &mut ChatState {
        &mut self.chat
    }

    /// Name of the chat room a connection serves
    pub fn room_name(&self, conn: ConnId) -> Option<&str> {
        self.chat.rooms.get(&conn).map(String::as_str)
    }

    /// Chat rooms with an open connection
    pub fn rooms(&self) -> impl Iterator<Item = (ConnId, &str)> {
        self.chat.rooms.iter().map(|(id, name)| (*id, name.as_str()))
    }

    pub fn client_binary(&self) -> Option<&[u8]> {
        self.client_binary.as_deref()
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn connection_ids(&self) -> Vec<ConnId> {
        self.connections.keys().copied().collect()
    }

    /// First live connection of `kind`
    pub fn get_connection(&self, kind: ConnectionKind) -> Option<&Connection> {
        self.connections
            .values()
            .find(|conn| conn.kind() == kind && conn.is_live())
    }

    /// Connections that are not dead yet
    pub fn open_connection_count(&self) -> usize {
        self.connections
            .values()
            .filter(|conn| !conn.is_dead())
            .count()
    }

    /// Main connection, once the login is ready
    pub fn main_ready(&self) -> Result<ConnId> {
        match self.get_connection(ConnectionKind::Main) {
            Some(conn) if self.login.state() == LoginState::Ready => Ok(conn.id()),
            _ => Err(OwlchatError::NotConnected {
                kind: ConnectionKind::Main,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Open a connection of `kind` and install its handlers
    ///
    /// A cookie, when given, is sent as the first frame once connected.
    pub fn open_connection(
        &mut self,
        kind: ConnectionKind,
        address: &str,
        cookie: Option<Cookie>,
        room: Option<RoomKey>,
    ) -> Result<ConnId> {
        let id = ConnId::new(self.next_conn_id);
        self.next_conn_id += 1;
        let now = self.now();
        let mut conn = Connection::open(id, kind, address, self.connector.as_mut(), now)?;
        if let Some(cookie) = cookie {
            conn.set_cookie(cookie);
        }
        conn.set_room(room);
        handshake::install_handlers(&mut conn.handlers, kind)?;
        self.connections.insert(id, conn);
        self.stats.connections_opened += 1;
        info!("Opening {} connection {} to {}", kind, id, address);
        Ok(id)
    }

    /// Obtain a service connection of `kind`
    ///
    /// Reuses a live connection when one exists (`Some`); otherwise asks
    /// the main connection for a redirect (`None`).
    pub fn open_service(&mut self, kind: ConnectionKind) -> Result<Option<ConnId>> {
        if kind == ConnectionKind::ChatRoom {
            return Err(OwlchatError::invalid_argument(
                "chat rooms are opened through join_room",
            ));
        }
        if let Some(conn) = self.get_connection(kind) {
            return Ok(Some(conn.id()));
        }
        if self.service_requests.iter().any(|request| request.kind == kind) {
            debug!("Redirect for {} already requested", kind);
            return Ok(None);
        }
        self.request_service(ServiceRequest {
            kind,
            room: None,
            room_name: None,
        })?;
        Ok(None)
    }

    /// Ask the main connection for a chat room connection
    pub(crate) fn open_room(&mut self, room: RoomKey, name: String) -> Result<()> {
        self.request_service(ServiceRequest {
            kind: ConnectionKind::ChatRoom,
            room: Some(room),
            room_name: Some(name),
        })
    }

    fn request_service(&mut self, request: ServiceRequest) -> Result<()> {
        let family = request.kind.service_family().ok_or_else(|| {
            OwlchatError::invalid_argument(format!("{} is not a redirected service", request.kind))
        })?;
        let main = self.main_ready()?;
        let record = owlchat_core::protocol::outbound::service_request(family, request.room.as_ref())?;
        self.send(main, record)?;
        debug!("Requested redirect for {}", request.kind);
        self.service_requests.push_back(request);
        Ok(())
    }

    /// Oldest unanswered service request of `kind`
    pub(crate) fn take_service_request(&mut self, kind: ConnectionKind) -> Option<ServiceRequest> {
        let index = self
            .service_requests
            .iter()
            .position(|request| request.kind == kind)?;
        self.service_requests.remove(index)
    }

    /// Sign off and close one connection without treating it as lost
    pub fn close_connection(&mut self, id: ConnId) {
        let now = self.now();
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.mark_loss_reported();
            conn.sign_off(now);
        }
        for request in self.pending.take_for_connection(id) {
            self.resolve(request, Err(TransportError::ClosedLocally.into()));
        }
    }

    /// Close a connection after an error and run loss handling once
    pub fn fail_connection(&mut self, id: ConnId, err: OwlchatError) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.close();
        if !conn.mark_loss_reported() {
            return;
        }
        let kind = conn.kind();
        error!("{} connection {} lost: {}", kind, id, err);
        for request in self.pending.take_for_connection(id) {
            self.resolve(request, Err(TransportError::ClosedByPeer.into()));
        }
        handshake::on_connection_lost(self, id, kind, err);
    }

    /// Close every connection and clear all tables; idempotent
    ///
    /// Every transport is shut down before this returns.
    pub fn teardown(&mut self) {
        let now = self.now();
        for conn in self.connections.values_mut() {
            conn.mark_loss_reported();
            conn.sign_off(now);
        }
        for request in self.pending.take_all() {
            self.resolve(request, Err(TransportError::ClosedLocally.into()));
        }
        self.service_requests.clear();
        self.chat.clear();
        self.feedbag.clear();
        self.self_info = None;
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    fn alloc_request_id(&mut self) -> u32 {
        loop {
            let id = self.next_request_id;
            self.next_request_id = if id >= MAX_REQUEST_ID { 1 } else { id + 1 };
            if !self.pending.contains(id) {
                return id;
            }
        }
    }

    fn live_connection(&mut self, id: ConnId) -> Result<&mut Connection> {
        match self.connections.get_mut(&id) {
            Some(conn) if conn.is_live() => Ok(conn),
            _ => Err(TransportError::ClosedLocally.into()),
        }
    }

    /// Stamp a request id on `record` and queue it on `conn`
    pub fn send(&mut self, conn: ConnId, record: Record) -> Result<u32> {
        let request_id = self.alloc_request_id();
        let record = record.with_request_id(request_id);
        self.live_connection(conn)?.enqueue_record(&record)?;
        self.stats.records_sent += 1;
        trace!(
            "Queued 0x{:04x}/0x{:04x} request {} on {}",
            record.family,
            record.subtype,
            request_id,
            conn
        );
        Ok(request_id)
    }

    /// Queue a record ahead of pause and rate spacing
    pub fn send_urgent(&mut self, conn: ConnId, record: Record) -> Result<u32> {
        let request_id = self.alloc_request_id();
        let frame = record.with_request_id(request_id).into_frame()?;
        self.live_connection(conn)?.enqueue_urgent(frame)?;
        self.stats.records_sent += 1;
        Ok(request_id)
    }

    /// Queue a raw frame ahead of pause and rate spacing
    pub fn send_frame_urgent(&mut self, conn: ConnId, frame: Frame) -> Result<()> {
        self.live_connection(conn)?.enqueue_urgent(frame)
    }

    /// Send a record whose reply runs `continuation`, expiring after the
    /// configured request timeout
    pub fn send_request<F>(&mut self, conn: ConnId, record: Record, continuation: F) -> Result<u32>
    where
        F: FnOnce(&mut Session, Result<Reply>) -> Result<()> + 'static,
    {
        let timeout = self.config.timeouts.request();
        self.send_request_with_timeout(conn, record, timeout, continuation)
    }

    pub fn send_request_with_timeout<F>(
        &mut self,
        conn: ConnId,
        record: Record,
        timeout: Duration,
        continuation: F,
    ) -> Result<u32>
    where
        F: FnOnce(&mut Session, Result<Reply>) -> Result<()> + 'static,
    {
        let (family, subtype) = record.key();
        let request_id = self.send(conn, record)?;
        let expires_at = self.now() + timeout;
        self.pending.insert(PendingRequest {
            conn,
            request_id,
            family,
            subtype,
            expires_at,
            continuation: Box::new(continuation),
        })?;
        Ok(request_id)
    }

    /// Run a continuation, routing its error to the request's connection
    fn resolve(&mut self, request: PendingRequest, outcome: Result<Reply>) {
        let conn = request.conn;
        if let Err(err) = (request.continuation)(self, outcome) {
            self.report_error(conn, err);
        }
    }

    /// Fail every request whose deadline has passed, oldest first
    pub fn expire_pending(&mut self, now: Timestamp) -> usize {
        let expired = self.pending.take_expired(now);
        let count = expired.len();
        for request in expired {
            let what = request.describe();
            warn!("Timed out waiting for {} on {}", what, request.conn);
            self.stats.requests_timed_out += 1;
            self.resolve(request, Err(OwlchatError::timeout(what)));
        }
        count
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    pub fn notify(&mut self, notification: Notification) {
        debug!("Notification: {}", notification.kind());
        self.stats.notifications_emitted += 1;
        self.notifications.push_back(notification);
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    /// Fatal errors close the connection; others are counted and reported
    pub(crate) fn report_error(&mut self, id: ConnId, err: OwlchatError) {
        if err.is_connection_fatal() {
            self.fail_connection(id, err);
            return;
        }
        self.stats.handler_errors += 1;
        warn!("Error handling traffic on {}: {}", id, err);
        self.notify(Notification::ProtocolError {
            detail: err.to_string(),
        });
    }

    // ------------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------------

    fn deliver_event(&mut self, id: ConnId, event: ConnectionEvent) {
        if let Err(err) = dispatch::dispatch_event(self, id, event) {
            self.report_error(id, err);
        }
    }

    /// Service readiness reported for one connection
    pub fn on_ready(&mut self, id: ConnId, readable: bool, writable: bool) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if !conn.is_live() {
            return;
        }
        let mut readable = readable;
        if conn.state() == ConnState::Connecting {
            match conn.poll_connect() {
                Ok(true) => {
                    readable = true;
                    self.deliver_event(id, ConnectionEvent::ConnectComplete);
                }
                Ok(false) => return,
                Err(err) => {
                    self.deliver_event(
                        id,
                        ConnectionEvent::ConnectError {
                            reason: err.to_string(),
                        },
                    );
                    self.fail_connection(id, err);
                    return;
                }
            }
        }
        if writable {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.set_write_blocked(false);
            }
        }
        if readable {
            self.read_connection(id);
        }
    }

    fn read_connection(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let (frames, failure) = conn.on_readable();
        for frame in frames {
            if !self.connections.get(&id).map_or(false, Connection::is_live) {
                break;
            }
            self.handle_frame(id, frame);
        }
        if let Some(err) = failure {
            self.fail_connection(id, err);
        }
    }

    fn handle_frame(&mut self, id: ConnId, frame: Frame) {
        match frame.channel() {
            Channel::Control => match frame.control_version() {
                Ok((version, _)) => {
                    self.deliver_event(id, ConnectionEvent::VersionNegotiated { version })
                }
                Err(err) => self.report_error(id, err),
            },
            Channel::Data => {
                let outcome = Record::from_frame(&frame)
                    .and_then(|record| dispatch::dispatch_record(self, id, &record));
                match outcome {
                    Ok(_) => self.stats.records_dispatched += 1,
                    Err(err) => self.report_error(id, err),
                }
            }
            Channel::Error => {
                warn!(
                    "Server reported a framing error on {}: {}",
                    id,
                    hex::encode(frame.payload())
                );
            }
            Channel::Close => {
                if let Err(err) = handshake::on_close_frame(self, id, frame.payload()) {
                    self.report_error(id, err);
                }
            }
            Channel::KeepAlive => trace!("Keep-alive on {}", id),
            Channel::Other(channel) => self.report_error(
                id,
                OwlchatError::protocol(format!("unexpected frame channel {}", channel)),
            ),
        }
    }

    /// Connections whose transport has no poller source
    pub fn has_unpolled_connections(&mut self) -> bool {
        self.connections
            .values_mut()
            .any(|conn| !conn.is_dead() && !conn.has_source())
    }

    /// Treat every source-less connection as readable and writable
    pub fn service_unpolled(&mut self) {
        let ids: Vec<ConnId> = self
            .connections
            .iter_mut()
            .filter_map(|(id, conn)| (!conn.is_dead() && !conn.has_source()).then_some(*id))
            .collect();
        for id in ids {
            self.on_ready(id, true, true);
        }
    }

    /// Write queued output on every connection that can take it
    pub fn flush_all(&mut self) {
        let now = self.now();
        let mut failed = Vec::new();
        for (id, conn) in self.connections.iter_mut() {
            if conn.is_write_blocked() || conn.state() != ConnState::Ready {
                continue;
            }
            if !conn.has_pending_output() {
                continue;
            }
            if let Err(err) = conn.on_writable(now) {
                failed.push((*id, err));
            }
        }
        for (id, err) in failed {
            self.fail_connection(id, err);
        }
        handshake::after_flush(self);
    }

    /// Earliest moment a rate-spaced frame may go out
    pub fn next_send_at(&self) -> Option<Timestamp> {
        self.connections
            .values()
            .filter_map(Connection::next_send_at)
            .min()
    }

    /// Remove dead connections, failing anything still pending on them
    pub fn take_dead(&mut self) -> Vec<Connection> {
        let dead: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_dead())
            .map(|(id, _)| *id)
            .collect();
        let mut reaped = Vec::with_capacity(dead.len());
        for id in dead {
            for request in self.pending.take_for_connection(id) {
                self.resolve(request, Err(TransportError::ClosedLocally.into()));
            }
            self.chat.rooms.remove(&id);
            self.chat.announced.remove(&id);
            if let Some(conn) = self.connections.remove(&id) {
                debug!("Reaped {} connection {}", conn.kind(), id);
                reaped.push(conn);
            }
        }
        reaped
    }

    /// Live connection of `kind` whose service handshake has finished
    pub(crate) fn online_connection(&self, kind: ConnectionKind) -> Option<ConnId> {
        self.connections
            .values()
            .find(|conn| {
                conn.kind() == kind && conn.is_live() && conn.phase() == ServicePhase::Online
            })
            .map(Connection::id)
    }
}
