//! Single-threaded readiness scheduler
//!
//! One [`Scheduler::run_once`] call is one iteration of the engine loop:
//! register new connections with the poller, compute the wait from the
//! caller's bound, the earliest timer and any rate-spaced send, run the
//! pre-poll hooks, poll, service readiness, flush queued output, fire due
//! timers, and reap dead connections. Nothing here blocks except the poll
//! itself.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};
use owlchat_core::{OwlchatError, Result, Timestamp, TransportError};
use tracing::{trace, warn};

use crate::connection::ConnId;
use crate::session::Session;

/// Tokens at or above this value belong to extra sources, not connections
const SOURCE_TOKEN_BASE: usize = 1 << 30;

const EVENT_CAPACITY: usize = 256;

// ----------------------------------------------------------------------------
// Timers
// ----------------------------------------------------------------------------

/// Handle for cancelling a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// Timer body; gets the context and the list so it can add or cancel timers
pub type TimerCallback<C> = Box<dyn FnMut(&mut C, &mut TimerList<C>)>;

struct TimerEntry<C> {
    fire_at: Timestamp,
    interval: Option<Duration>,
    callback: TimerCallback<C>,
}

/// One-shot and interval timers ordered by deadline
///
/// A firing timer is taken out of the list before its callback runs, so
/// callbacks may add and cancel timers (their own included) at will.
pub struct TimerList<C> {
    timers: BTreeMap<TimerId, TimerEntry<C>>,
    cancelled: BTreeSet<TimerId>,
    next_id: u64,
}

impl<C> fmt::Debug for TimerList<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerList")
            .field("timers", &self.timers.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

impl<C> Default for TimerList<C> {
    fn default() -> Self {
        Self {
            timers: BTreeMap::new(),
            cancelled: BTreeSet::new(),
            next_id: 1,
        }
    }
}

impl<C> TimerList<C> {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, fire_at: Timestamp, interval: Option<Duration>, callback: TimerCallback<C>) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.timers.insert(
            id,
            TimerEntry {
                fire_at,
                interval,
                callback,
            },
        );
        id
    }

    /// Fire once at `fire_at`
    pub fn add_oneshot<F>(&mut self, fire_at: Timestamp, callback: F) -> TimerId
    where
        F: FnMut(&mut C, &mut TimerList<C>) + 'static,
    {
        self.insert(fire_at, None, Box::new(callback))
    }

    /// Fire at `first_at` and every `interval` after
    pub fn add_interval<F>(&mut self, first_at: Timestamp, interval: Duration, callback: F) -> TimerId
    where
        F: FnMut(&mut C, &mut TimerList<C>) + 'static,
    {
        let interval = interval.max(Duration::from_millis(1));
        self.insert(first_at, Some(interval), Box::new(callback))
    }

    /// Cancel a timer; safe from inside any callback
    pub fn cancel(&mut self, id: TimerId) {
        if self.timers.remove(&id).is_none() {
            self.cancelled.insert(id);
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.values().map(|entry| entry.fire_at).min()
    }

    /// Run every timer due at `now`, earliest first; returns how many fired
    ///
    /// Timers added by callbacks wait for the next pass even when already due.
    pub fn fire_due(&mut self, ctx: &mut C, now: Timestamp) -> usize {
        let mut due: Vec<(Timestamp, TimerId)> = self
            .timers
            .iter()
            .filter(|(_, entry)| entry.fire_at <= now)
            .map(|(id, entry)| (entry.fire_at, *id))
            .collect();
        due.sort();

        let mut fired = 0;
        for (_, id) in due {
            let Some(mut entry) = self.timers.remove(&id) else {
                continue;
            };
            (entry.callback)(ctx, self);
            fired += 1;
            if let Some(interval) = entry.interval {
                if !self.cancelled.contains(&id) {
                    let mut next = entry.fire_at + interval;
                    if next <= now {
                        next = now + interval;
                    }
                    entry.fire_at = next;
                    self.timers.insert(id, entry);
                }
            }
        }
        self.cancelled.clear();
        fired
    }
}

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

/// Runs before each poll; returning true asks for a non-blocking poll
pub type PrePollHook = Box<dyn FnMut(&mut Session) -> bool>;

/// Called with readiness for an extra registered source
pub type SourceCallback = Box<dyn FnMut(&mut Session, &mio::event::Event)>;

/// Readiness loop over the session's connections, timers and extra sources
pub struct Scheduler {
    poll: Poll,
    events: Events,
    timers: TimerList<Session>,
    hooks: Vec<PrePollHook>,
    sources: BTreeMap<usize, SourceCallback>,
    next_source_token: usize,
    iterations: u64,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("timers", &self.timers)
            .field("hooks", &self.hooks.len())
            .field("sources", &self.sources.len())
            .field("iterations", &self.iterations)
            .finish()
    }
}

fn io_error(err: io::Error) -> OwlchatError {
    TransportError::Io(err).into()
}

impl Scheduler {
    pub fn new() -> Result<Self> {
        Ok(Self {
            poll: Poll::new().map_err(io_error)?,
            events: Events::with_capacity(EVENT_CAPACITY),
            timers: TimerList::new(),
            hooks: Vec::new(),
            sources: BTreeMap::new(),
            next_source_token: SOURCE_TOKEN_BASE,
            iterations: 0,
        })
    }

    pub fn timers(&self) -> &TimerList<Session> {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut TimerList<Session> {
        &mut self.timers
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Add a hook run before every poll
    pub fn add_pre_poll_hook<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Session) -> bool + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    /// Poll an extra source alongside the connections
    pub fn register_source<S, F>(&mut self, source: &mut S, interest: Interest, callback: F) -> Result<Token>
    where
        S: mio::event::Source + ?Sized,
        F: FnMut(&mut Session, &mio::event::Event) + 'static,
    {
        let token = Token(self.next_source_token);
        self.poll
            .registry()
            .register(source, token, interest)
            .map_err(io_error)?;
        self.next_source_token += 1;
        self.sources.insert(token.0, Box::new(callback));
        Ok(token)
    }

    pub fn deregister_source<S>(&mut self, source: &mut S, token: Token) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.sources.remove(&token.0);
        self.poll.registry().deregister(source).map_err(io_error)
    }

    fn register_connections(&mut self, session: &mut Session) {
        let mut failed = Vec::new();
        for id in session.connection_ids() {
            let Some(conn) = session.connection_mut(id) else {
                continue;
            };
            if conn.is_registered() || conn.is_dead() {
                continue;
            }
            let outcome = match conn.source() {
                Some(source) => Some(self.poll.registry().register(
                    source,
                    id.token(),
                    Interest::READABLE | Interest::WRITABLE,
                )),
                None => None,
            };
            match outcome {
                Some(Ok(())) => conn.set_registered(true),
                Some(Err(err)) => failed.push((id, err)),
                None => {}
            }
        }
        for (id, err) in failed {
            session.fail_connection(id, io_error(err));
        }
    }

    fn wait_for(&mut self, session: &mut Session, max_wait: Option<Duration>) -> Option<Duration> {
        let now = session.now();
        let mut timeout = max_wait;
        let deadlines = [self.timers.next_deadline(), session.next_send_at()];
        for deadline in deadlines.into_iter().flatten() {
            let wait = now.until(deadline);
            timeout = Some(timeout.map_or(wait, |current| current.min(wait)));
        }

        let mut busy = false;
        for hook in &mut self.hooks {
            busy |= hook(session);
        }
        if busy || session.has_unpolled_connections() {
            timeout = Some(Duration::ZERO);
        }
        timeout
    }

    fn reap(&mut self, session: &mut Session) {
        for mut conn in session.take_dead() {
            if !conn.is_registered() {
                continue;
            }
            let id = conn.id();
            if let Some(source) = conn.source() {
                if let Err(err) = self.poll.registry().deregister(source) {
                    trace!("Deregistering {} failed: {}", id, err);
                }
            }
        }
    }

    /// One loop iteration; blocks at most `max_wait` (forever when `None`
    /// and nothing else bounds the wait)
    pub fn run_once(&mut self, session: &mut Session, max_wait: Option<Duration>) -> Result<()> {
        self.iterations += 1;
        self.register_connections(session);

        let timeout = self.wait_for(session, max_wait);
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => self.events.clear(),
            Err(err) => return Err(io_error(err)),
        }

        let mut ready = Vec::new();
        for event in self.events.iter() {
            let token = event.token().0;
            if token >= SOURCE_TOKEN_BASE {
                match self.sources.get_mut(&token) {
                    Some(callback) => callback(session, event),
                    None => warn!("Readiness for unknown source token {}", token),
                }
                continue;
            }
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed();
            ready.push((ConnId::new(token as u64), readable, writable));
        }
        for (id, readable, writable) in ready {
            session.on_ready(id, readable, writable);
        }
        session.service_unpolled();
        session.flush_all();

        let now = session.now();
        let fired = self.timers.fire_due(session, now);
        if fired > 0 {
            trace!("Fired {} timers", fired);
            session.flush_all();
        }

        self.reap(session);
        Ok(())
    }
}
