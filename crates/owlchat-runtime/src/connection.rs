//! Connections
//!
//! One [`Connection`] per open transport: it owns the byte stream, the
//! inbound frame buffer and the outbound queue, and enforces pause and
//! rate-limit spacing on transmission. Connections never interpret
//! records; the session does that with the handler table each connection
//! carries.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::time::Duration;

use owlchat_core::protocol::frame::{encode_frame, Frame, FrameBuffer, FrameError};
use owlchat_core::protocol::outbound;
use owlchat_core::protocol::RoomKey;
use owlchat_core::{
    ConnectionKind, Cookie, OwlchatError, RateTable, Record, Result, Timestamp, TransportError,
};
use rand_core::{OsRng, RngCore};
use tracing::{debug, trace};

use crate::dispatch::HandlerTable;
use crate::transport::{Connector, Transport};

const READ_CHUNK: usize = 4096;

// ----------------------------------------------------------------------------
// Identifiers and States
// ----------------------------------------------------------------------------

/// Session-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Poller token for this connection
    pub fn token(&self) -> mio::Token {
        mio::Token(self.0 as usize)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Transport-level lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Connect in progress
    Connecting,
    /// Usable for reads and writes
    Ready,
    /// Writing the sign-off; never outlives [`Connection::sign_off`]
    Closing,
    /// Closed; reaped at the end of the scheduler iteration
    Dead,
}

/// Progress of the service handshake on a cookie-login connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServicePhase {
    Connecting,
    CookieSent,
    VersionsSent,
    RateRequested,
    /// Post-connect requests sent; waiting for the list or rights replies
    Setup,
    Online,
}

#[derive(Debug)]
struct Outgoing {
    frame: Frame,
    /// Exempt from pause and rate spacing
    urgent: bool,
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

/// One open transport and its framing state
pub struct Connection {
    id: ConnId,
    kind: ConnectionKind,
    address: String,
    state: ConnState,
    phase: ServicePhase,
    transport: Box<dyn Transport>,
    inbound: FrameBuffer,
    queue: VecDeque<Outgoing>,
    write_buf: Vec<u8>,
    write_pos: usize,
    next_sequence: u16,
    min_send_interval: Duration,
    last_send_at: Option<Timestamp>,
    paused: bool,
    write_blocked: bool,
    registered: bool,
    loss_reported: bool,
    cookie: Option<Cookie>,
    room: Option<RoomKey>,
    families: Vec<u16>,
    rates: RateTable,
    pub(crate) handlers: HandlerTable,
    opened_at: Timestamp,
    frames_sent: u64,
    frames_received: u64,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("address", &self.address)
            .field("state", &self.state)
            .field("phase", &self.phase)
            .field("queued", &self.queue.len())
            .field("paused", &self.paused)
            .field("min_send_interval", &self.min_send_interval)
            .finish()
    }
}

impl Connection {
    /// Wrap an already-opened transport
    pub fn new(
        id: ConnId,
        kind: ConnectionKind,
        address: &str,
        transport: Box<dyn Transport>,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            kind,
            address: address.to_string(),
            state: ConnState::Connecting,
            phase: ServicePhase::Connecting,
            transport,
            inbound: FrameBuffer::new(),
            queue: VecDeque::new(),
            write_buf: Vec::new(),
            write_pos: 0,
            next_sequence: (OsRng.next_u32() & 0xffff) as u16,
            min_send_interval: Duration::ZERO,
            last_send_at: None,
            paused: false,
            write_blocked: false,
            registered: false,
            loss_reported: false,
            cookie: None,
            room: None,
            families: Vec::new(),
            rates: RateTable::new(),
            handlers: HandlerTable::new(),
            opened_at: now,
            frames_sent: 0,
            frames_received: 0,
        }
    }

    /// Ask `connector` for a transport to `address` and wrap it
    pub fn open(
        id: ConnId,
        kind: ConnectionKind,
        address: &str,
        connector: &mut dyn Connector,
        now: Timestamp,
    ) -> Result<Self> {
        let transport = connector
            .connect(kind, address)
            .map_err(|err| OwlchatError::connect_failed(address, err.to_string()))?;
        debug!("Opened {} connection {} to {}", kind, id, address);
        Ok(Self::new(id, kind, address, transport, now))
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn phase(&self) -> ServicePhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: ServicePhase) {
        trace!("{} phase {:?} -> {:?}", self.id, self.phase, phase);
        self.phase = phase;
    }

    /// Connecting or ready
    pub fn is_live(&self) -> bool {
        matches!(self.state, ConnState::Connecting | ConnState::Ready)
    }

    pub fn is_dead(&self) -> bool {
        self.state == ConnState::Dead
    }

    pub fn opened_at(&self) -> Timestamp {
        self.opened_at
    }

    pub fn set_cookie(&mut self, cookie: Cookie) {
        self.cookie = Some(cookie);
    }

    /// The login cookie; yielded once
    pub fn take_cookie(&mut self) -> Option<Cookie> {
        self.cookie.take()
    }

    pub fn room(&self) -> Option<&RoomKey> {
        self.room.as_ref()
    }

    pub fn set_room(&mut self, room: Option<RoomKey>) {
        self.room = room;
    }

    /// Families the server offered on this connection
    pub fn families(&self) -> &[u16] {
        &self.families
    }

    pub fn set_families(&mut self, families: Vec<u16>) {
        self.families = families;
    }

    pub fn rates(&self) -> &RateTable {
        &self.rates
    }

    pub fn rates_mut(&mut self) -> &mut RateTable {
        &mut self.rates
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn min_send_interval(&self) -> Duration {
        self.min_send_interval
    }

    pub fn set_min_send_interval(&mut self, interval: Duration) {
        self.min_send_interval = interval;
    }

    pub fn is_write_blocked(&self) -> bool {
        self.write_blocked
    }

    pub fn set_write_blocked(&mut self, blocked: bool) {
        self.write_blocked = blocked;
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn set_registered(&mut self, registered: bool) {
        self.registered = registered;
    }

    /// Flag the connection's loss as handled; true only the first time
    pub fn mark_loss_reported(&mut self) -> bool {
        !std::mem::replace(&mut self.loss_reported, true)
    }

    /// Handler table for registering extra record or event handlers
    pub fn handlers_mut(&mut self) -> &mut HandlerTable {
        &mut self.handlers
    }

    /// Readiness source of the underlying transport
    pub fn source(&mut self) -> Option<&mut dyn mio::event::Source> {
        self.transport.source()
    }

    pub fn has_source(&mut self) -> bool {
        self.transport.source().is_some()
    }

    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    /// Queued frames or a partially written frame remain
    pub fn has_pending_output(&self) -> bool {
        !self.queue.is_empty() || self.write_pos < self.write_buf.len()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    // ------------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------------

    /// Drive a pending connect; `Ok(true)` exactly once, when it completes
    pub fn poll_connect(&mut self) -> Result<bool> {
        if self.state != ConnState::Connecting {
            return Ok(false);
        }
        match self.transport.poll_connect() {
            Ok(true) => {
                self.state = ConnState::Ready;
                debug!("{} connected to {}", self.id, self.address);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => {
                self.close();
                Err(OwlchatError::connect_failed(
                    self.address.clone(),
                    err.to_string(),
                ))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    fn push(&mut self, frame: Frame, urgent: bool) -> Result<()> {
        if !self.is_live() {
            return Err(TransportError::ClosedLocally.into());
        }
        self.queue.push_back(Outgoing { frame, urgent });
        Ok(())
    }

    /// Queue a frame behind pause and rate spacing
    pub fn enqueue(&mut self, frame: Frame) -> Result<()> {
        self.push(frame, false)
    }

    /// Queue a frame that ignores pause and rate spacing
    pub fn enqueue_urgent(&mut self, frame: Frame) -> Result<()> {
        self.push(frame, true)
    }

    pub fn enqueue_record(&mut self, record: &Record) -> Result<()> {
        self.enqueue(record.into_frame()?)
    }

    fn spacing_elapsed(&self, now: Timestamp) -> bool {
        match self.last_send_at {
            Some(last) if !self.min_send_interval.is_zero() => {
                now >= last + self.min_send_interval
            }
            _ => true,
        }
    }

    fn next_sendable(&self, now: Timestamp) -> Option<usize> {
        let head = self.queue.front()?;
        if head.urgent || (!self.paused && self.spacing_elapsed(now)) {
            return Some(0);
        }
        self.queue.iter().position(|out| out.urgent)
    }

    /// When the next held frame becomes sendable, if one waits on spacing
    pub fn next_send_at(&self) -> Option<Timestamp> {
        if self.paused || self.min_send_interval.is_zero() || self.queue.is_empty() {
            return None;
        }
        self.last_send_at.map(|last| last + self.min_send_interval)
    }

    /// Write queued frames until the queue drains, spacing holds the next
    /// frame, or the transport stops accepting bytes
    ///
    /// Sequence numbers are stamped as frames leave the queue, so they stay
    /// strictly increasing in transmission order. Returns frames started.
    pub fn on_writable(&mut self, now: Timestamp) -> Result<usize> {
        if !matches!(self.state, ConnState::Ready | ConnState::Closing) {
            return Ok(0);
        }
        let mut started = 0;
        loop {
            if self.write_pos >= self.write_buf.len() {
                self.write_buf.clear();
                self.write_pos = 0;
                let Some(index) = self.next_sendable(now) else {
                    break;
                };
                let Some(mut out) = self.queue.remove(index) else {
                    break;
                };
                out.frame.set_sequence(self.next_sequence);
                self.next_sequence = self.next_sequence.wrapping_add(1);
                if !out.urgent {
                    self.last_send_at = Some(now);
                }
                trace!(
                    "{} sending {} frame seq {}",
                    self.id,
                    out.frame.channel(),
                    out.frame.sequence()
                );
                self.write_buf = encode_frame(&out.frame);
                self.frames_sent += 1;
                started += 1;
            }
            match self.transport.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => {
                    return Err(TransportError::Io(io::ErrorKind::WriteZero.into()).into());
                }
                Ok(n) => self.write_pos += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.write_blocked = true;
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Io(err).into()),
            }
        }
        Ok(started)
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Read everything available and return the complete frames in order
    ///
    /// A transport error or end of stream is returned alongside the frames
    /// decoded before it. A corrupt stream kills the connection and yields
    /// no frames.
    pub fn on_readable(&mut self) -> (Vec<Frame>, Option<OwlchatError>) {
        if self.is_dead() {
            return (Vec::new(), None);
        }
        let mut chunk = [0u8; READ_CHUNK];
        let mut failure = None;
        loop {
            match self.transport.read(&mut chunk) {
                Ok(0) => {
                    failure = Some(TransportError::ClosedByPeer.into());
                    break;
                }
                Ok(n) => self.inbound.extend(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    failure = Some(TransportError::Io(err).into());
                    break;
                }
            }
        }

        let mut frames = Vec::new();
        loop {
            match self.inbound.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(FrameError::NeedMoreData) => break,
                Err(err) => {
                    self.close();
                    return (Vec::new(), Some(err.into()));
                }
            }
        }
        self.frames_received += frames.len() as u64;
        (frames, failure)
    }

    // ------------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------------

    /// Sign off and close before returning
    ///
    /// A ready connection queues the sign-off and gets one non-blocking
    /// write pass; output the transport does not take is dropped.
    pub fn sign_off(&mut self, now: Timestamp) {
        if self.state == ConnState::Ready {
            if let Ok(frame) = outbound::sign_off() {
                self.queue.push_back(Outgoing {
                    frame,
                    urgent: true,
                });
            }
            self.state = ConnState::Closing;
            match self.on_writable(now) {
                Ok(_) if self.has_pending_output() => {
                    debug!("{} closed with {} frames unsent", self.id, self.queue.len());
                }
                Ok(_) => {}
                Err(err) => debug!("Sign-off on {} not delivered: {}", self.id, err),
            }
        }
        self.close();
    }

    /// Close immediately; idempotent
    pub fn close(&mut self) {
        if self.state == ConnState::Dead {
            return;
        }
        debug!("Closing {} connection {}", self.kind, self.id);
        self.transport.shutdown();
        self.state = ConnState::Dead;
        self.queue.clear();
        self.write_buf.clear();
        self.write_pos = 0;
        self.inbound.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryEndpoint, MemoryNetwork};
    use owlchat_core::Channel;

    fn open(network: &MemoryNetwork) -> (Connection, MemoryEndpoint) {
        let mut connector = network.connector();
        let mut conn = Connection::open(
            ConnId::new(1),
            ConnectionKind::Main,
            "bos:5190",
            &mut connector,
            Timestamp::ZERO,
        )
        .unwrap();
        assert!(conn.poll_connect().unwrap());
        let endpoint = network.last(ConnectionKind::Main).unwrap();
        (conn, endpoint)
    }

    fn data(byte: u8) -> Frame {
        Frame::new(Channel::Data, vec![byte]).unwrap()
    }

    #[test]
    fn test_sequence_increments_in_send_order() {
        let network = MemoryNetwork::new();
        let (mut conn, endpoint) = open(&network);
        for byte in 0..3 {
            conn.enqueue(data(byte)).unwrap();
        }
        assert_eq!(conn.on_writable(Timestamp::ZERO).unwrap(), 3);

        let frames = endpoint.take_frames();
        assert_eq!(frames.len(), 3);
        for pair in frames.windows(2) {
            assert_eq!(pair[1].sequence(), pair[0].sequence().wrapping_add(1));
        }
        assert_eq!(frames[2].payload(), &[2]);
    }

    #[test]
    fn test_throttle_spaces_frames() {
        let network = MemoryNetwork::new();
        let (mut conn, endpoint) = open(&network);
        conn.set_min_send_interval(Duration::from_millis(500));
        conn.enqueue(data(1)).unwrap();
        conn.enqueue(data(2)).unwrap();

        assert_eq!(conn.on_writable(Timestamp::new(1_000)).unwrap(), 1);
        assert_eq!(conn.next_send_at(), Some(Timestamp::new(1_500)));
        assert_eq!(conn.on_writable(Timestamp::new(1_200)).unwrap(), 0);
        assert_eq!(conn.on_writable(Timestamp::new(1_500)).unwrap(), 1);
        assert_eq!(endpoint.take_frames().len(), 2);
        assert!(!conn.has_pending_output());
    }

    #[test]
    fn test_pause_holds_all_but_urgent() {
        let network = MemoryNetwork::new();
        let (mut conn, endpoint) = open(&network);
        conn.set_paused(true);
        conn.enqueue(data(1)).unwrap();
        conn.enqueue_urgent(data(9)).unwrap();

        assert_eq!(conn.on_writable(Timestamp::ZERO).unwrap(), 1);
        assert_eq!(endpoint.take_frames()[0].payload(), &[9]);

        conn.set_paused(false);
        assert_eq!(conn.on_writable(Timestamp::ZERO).unwrap(), 1);
        assert_eq!(endpoint.take_frames()[0].payload(), &[1]);
    }

    #[test]
    fn test_partial_write_resumes() {
        let network = MemoryNetwork::new();
        let (mut conn, endpoint) = open(&network);
        endpoint.limit_writes(Some(4));
        conn.enqueue(data(7)).unwrap();

        conn.on_writable(Timestamp::ZERO).unwrap();
        assert!(conn.is_write_blocked());
        assert!(conn.has_pending_output());

        endpoint.limit_writes(None);
        conn.set_write_blocked(false);
        conn.on_writable(Timestamp::ZERO).unwrap();
        let frames = endpoint.take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[7]);
    }

    #[test]
    fn test_reads_split_frames() {
        let network = MemoryNetwork::new();
        let (mut conn, endpoint) = open(&network);
        let bytes = encode_frame(&data(5).with_sequence(3));

        endpoint.push_bytes(&bytes[..4]);
        let (frames, failure) = conn.on_readable();
        assert!(frames.is_empty());
        assert!(failure.is_none());

        endpoint.push_bytes(&bytes[4..]);
        let (frames, failure) = conn.on_readable();
        assert_eq!(frames.len(), 1);
        assert!(failure.is_none());
    }

    #[test]
    fn test_corrupt_stream_kills_connection() {
        let network = MemoryNetwork::new();
        let (mut conn, endpoint) = open(&network);
        endpoint.push_bytes(&[0x00, 0x02, 0x00, 0x01, 0x00, 0x00]);
        let (frames, failure) = conn.on_readable();
        assert!(frames.is_empty());
        assert!(matches!(failure, Some(OwlchatError::Protocol(_))));
        assert!(conn.is_dead());
        assert!(endpoint.is_closed_by_client());
    }

    #[test]
    fn test_peer_close_after_frames() {
        let network = MemoryNetwork::new();
        let (mut conn, endpoint) = open(&network);
        endpoint.push_frame(&data(1));
        endpoint.close();
        let (frames, failure) = conn.on_readable();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            failure,
            Some(OwlchatError::Transport(TransportError::ClosedByPeer))
        ));
    }

    #[test]
    fn test_sign_off_flushes_and_closes() {
        let network = MemoryNetwork::new();
        let (mut conn, endpoint) = open(&network);
        conn.enqueue(data(1)).unwrap();
        conn.sign_off(Timestamp::ZERO);
        assert!(conn.is_dead());
        assert!(endpoint.is_closed_by_client());
        assert!(conn.enqueue(data(2)).is_err());

        let frames = endpoint.take_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].channel(), Channel::Close);
    }

    #[test]
    fn test_sign_off_closes_write_blocked_transport() {
        let network = MemoryNetwork::new();
        let (mut conn, endpoint) = open(&network);
        endpoint.limit_writes(Some(0));
        conn.enqueue(data(1)).unwrap();
        conn.sign_off(Timestamp::ZERO);

        assert!(conn.is_dead());
        assert!(!conn.has_pending_output());
        assert!(endpoint.is_closed_by_client());
        assert!(endpoint.take_frames().is_empty());

        conn.sign_off(Timestamp::ZERO);
        assert!(conn.is_dead());
    }

    #[test]
    fn test_cookie_taken_once() {
        let network = MemoryNetwork::new();
        let (mut conn, _endpoint) = open(&network);
        conn.set_cookie(Cookie::new(b"K".to_vec()));
        assert!(conn.take_cookie().is_some());
        assert!(conn.take_cookie().is_none());
    }
}
