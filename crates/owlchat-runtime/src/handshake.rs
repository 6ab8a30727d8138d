//! Login handshake, redirects and rate-limit reactions
//!
//! Handlers that carry a login from the authorizer to a ready main
//! connection, and every redirected service connection through its own
//! cookie login and setup. Also owns the session-wide reactions to
//! connection loss: authorizer retries with backoff, login failure, and
//! the single `Disconnected` notification for an established session.

use owlchat_core::protocol::auth::{TLV_COOKIE, TLV_ERROR_CODE};
use owlchat_core::protocol::families::{self, auth as auth_sub, generic, ssi};
use owlchat_core::protocol::frame::Frame;
use owlchat_core::protocol::inbound::close_reason;
use owlchat_core::protocol::outbound;
use owlchat_core::protocol::{auth, AuthResult, TlvChain};
use owlchat_core::{
    AuthenticationError, ConnectionKind, Inbound, LoginFailure, Notification, OwlchatError,
    ProtocolViolation, RateReaction, Record, RegistryError, Result, TransportError,
};
use tracing::{debug, info, trace, warn};

use crate::connection::{ConnId, ServicePhase};
use crate::dispatch::{ConnectionEvent, EventKind, HandlerTable};
use crate::login::{Credentials, LoginEvent, LoginState};
use crate::services;
use crate::session::Session;

/// Close reason the server gives when the same name signs on elsewhere
const REASON_SIGNED_ON_ELSEWHERE: u16 = 0x0001;

// ----------------------------------------------------------------------------
// Handler Installation
// ----------------------------------------------------------------------------

/// Install the handlers a connection of `kind` needs
pub(crate) fn install_handlers(
    table: &mut HandlerTable,
    kind: ConnectionKind,
) -> core::result::Result<(), RegistryError> {
    table.register_event(EventKind::ConnectError, on_connect_error)?;
    if kind == ConnectionKind::Auth {
        table.register_event(EventKind::ConnectComplete, on_auth_connected)?;
        table.register(families::AUTH, auth_sub::KEY_REPLY, on_auth_key)?;
        table.register(families::AUTH, auth_sub::LOGIN_REPLY, on_auth_reply)?;
        table.register(families::AUTH, families::ERROR, on_auth_error)?;
        return Ok(());
    }

    table.register_event(EventKind::ConnectComplete, on_service_connected)?;
    table.register_event(EventKind::VersionNegotiated, on_version)?;
    table.register(families::GENERIC, generic::SERVER_READY, on_server_ready)?;
    table.register(families::GENERIC, generic::VERSIONS_ACK, on_versions_ack)?;
    table.register(families::GENERIC, generic::RATE_INFO, on_rate_info)?;
    table.register(families::GENERIC, generic::RATE_CHANGE, on_rate_change)?;
    table.register(families::GENERIC, generic::SERVER_PAUSE, on_server_pause)?;
    table.register(families::GENERIC, generic::SERVER_RESUME, on_server_resume)?;
    table.register(families::GENERIC, generic::VERIFY_REQUEST, on_verify_request)?;
    table.register(families::GENERIC, generic::MOTD, on_motd)?;
    table.register(families::GENERIC, families::ERROR, on_service_error)?;

    if kind == ConnectionKind::Main {
        table.register(families::GENERIC, generic::REDIRECT, on_redirect)?;
        table.register(families::GENERIC, generic::SELF_INFO, on_self_info)?;
        table.register(families::GENERIC, generic::WARNED, on_warned)?;
        table.register(families::SSI, ssi::LIST, on_ssi_list)?;
        table.register(families::SSI, ssi::UNCHANGED, on_ssi_list)?;
    }
    services::install(table, kind)
}

fn unexpected(session: &Session, record: &Record) -> OwlchatError {
    ProtocolViolation::UnexpectedRecord {
        family: record.family,
        subtype: record.subtype,
        state: session.login_state().to_string(),
    }
    .into()
}

fn on_connect_error(_session: &mut Session, conn: ConnId, event: &ConnectionEvent) -> Result<()> {
    if let ConnectionEvent::ConnectError { reason } = event {
        warn!("Connect failed on {}: {}", conn, reason);
    }
    Ok(())
}

fn set_phase(session: &mut Session, conn: ConnId, phase: ServicePhase) {
    if let Some(connection) = session.connection_mut(conn) {
        connection.set_phase(phase);
    }
}

// ----------------------------------------------------------------------------
// Login Entry Points
// ----------------------------------------------------------------------------

/// Start a login; completion is reported through notifications
pub(crate) fn login(session: &mut Session, screen_name: &str, password: &str) -> Result<()> {
    if screen_name.trim().is_empty() {
        return Err(OwlchatError::invalid_argument("screen name cannot be empty"));
    }
    let state = session.login_state();
    if state.is_in_progress() {
        return Err(OwlchatError::invalid_argument("a login is already in progress"));
    }
    if state == LoginState::Ready {
        return Err(OwlchatError::invalid_argument("already signed on; log out first"));
    }

    session.teardown();
    let now = session.now();
    let cooldown = session
        .login_machine()
        .cooldown_until
        .filter(|until| *until > now);
    let deadline = cooldown.unwrap_or(now) + session.config().timeouts.login();
    session.login_mut().begin(
        Credentials {
            screen_name: screen_name.to_string(),
            password: password.to_string(),
        },
        deadline,
    );
    session.set_screen_name(screen_name.to_string());
    session.apply_login(LoginEvent::LoginRequested)?;

    match cooldown {
        Some(until) => {
            info!("Reconnect cooldown active; connecting in {:?}", now.until(until));
            session.login_mut().retry_at = Some(until);
        }
        None => connect_auth(session),
    }
    Ok(())
}

/// Sign off and close everything
pub(crate) fn logout(session: &mut Session) -> Result<()> {
    session.teardown();
    let login = session.login_mut();
    login.deadline = None;
    login.retry_at = None;
    if session.login_state() != LoginState::Disconnected {
        session.apply_login(LoginEvent::LoggedOut)?;
    }
    Ok(())
}

fn connect_auth(session: &mut Session) {
    let server = session.config().login_server.clone();
    match session.open_connection(ConnectionKind::Auth, &server, None, None) {
        Ok(id) => debug!("Authorizer connection {} opened", id),
        Err(err) => auth_transport_failed(session, err),
    }
}

/// End the login attempt with `failure`
pub(crate) fn fail_login(session: &mut Session, failure: LoginFailure) {
    if !session.login_state().is_in_progress() {
        debug!("Ignoring login failure {} in {}", failure, session.login_state());
        return;
    }
    warn!("Login failed: {}", failure.user_message());
    session.notify(Notification::LoginFailed { reason: failure });
    session.teardown();
    let login = session.login_mut();
    login.deadline = None;
    login.retry_at = None;
    if let Err(err) = session.apply_login(LoginEvent::Failed(failure)) {
        warn!("{}", err);
    }
}

fn auth_transport_failed(session: &mut Session, err: OwlchatError) {
    let reconnect = session.config().reconnect.clone();
    let login = session.login_machine();
    let retryable = matches!(err, OwlchatError::Transport(_))
        && !login.has_succeeded
        && login.auth_failures < reconnect.max_auth_retries;
    if !retryable {
        fail_login(session, err.login_failure());
        return;
    }

    let now = session.now();
    let login = session.login_mut();
    let attempt = login.auth_failures;
    login.auth_failures += 1;
    let delay = reconnect.backoff(attempt);
    login.retry_at = Some(now + delay);
    login.cooldown_until = Some(now + delay);
    info!(
        "Authorizer unreachable ({}); retry {} of {} in {:?}",
        err,
        attempt + 1,
        reconnect.max_auth_retries,
        delay
    );
    if let Err(err) = session.apply_login(LoginEvent::AuthRetry) {
        warn!("{}", err);
    }
}

// ----------------------------------------------------------------------------
// Periodic Work
// ----------------------------------------------------------------------------

/// Expire pending requests, enforce the login deadline, run due retries
pub(crate) fn sweep(session: &mut Session) {
    let now = session.now();
    session.expire_pending(now);

    let login = session.login_machine();
    if login.state().is_in_progress() && login.deadline.is_some_and(|deadline| now >= deadline) {
        fail_login(session, LoginFailure::Timeout);
        return;
    }
    let retry_due = login.state() == LoginState::AuthConnecting
        && login.retry_at.is_some_and(|at| now >= at);
    if retry_due {
        session.login_mut().retry_at = None;
        connect_auth(session);
    }
}

/// Keep-alive on the main connection of a ready session
pub(crate) fn keepalive(session: &mut Session) {
    let Ok(main) = session.main_ready() else {
        return;
    };
    let outcome = outbound::keepalive().and_then(|frame| session.send_frame_urgent(main, frame));
    if let Err(err) = outcome {
        debug!("Keep-alive not sent: {}", err);
    }
}

/// Credentials count as sent once the authorizer queue drains
pub(crate) fn after_flush(session: &mut Session) {
    if session.login_state() != LoginState::SendingCredentials {
        return;
    }
    let flushed = session
        .get_connection(ConnectionKind::Auth)
        .is_some_and(|conn| !conn.has_pending_output());
    if flushed {
        if let Err(err) = session.apply_login(LoginEvent::CredentialsFlushed) {
            warn!("{}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Loss
// ----------------------------------------------------------------------------

/// React to a connection that closed without being asked to
pub(crate) fn on_connection_lost(
    session: &mut Session,
    conn: ConnId,
    kind: ConnectionKind,
    err: OwlchatError,
) {
    let state = session.login_state();
    match kind {
        ConnectionKind::Auth if state.is_authorizing() => auth_transport_failed(session, err),
        ConnectionKind::Main if state == LoginState::Ready => end_session(session, err.to_string()),
        ConnectionKind::Main if state.is_in_progress() => fail_login(session, err.login_failure()),
        ConnectionKind::ChatRoom => {
            if let Some(room) = session.room_name(conn) {
                info!("Lost chat room {}", room);
            }
        }
        _ => debug!("{} connection {} lost in {}", kind, conn, state),
    }
}

fn end_session(session: &mut Session, reason: String) {
    warn!("Session ended: {}", reason);
    session.notify(Notification::Disconnected { reason });
    session.teardown();
    if let Err(err) = session.apply_login(LoginEvent::ConnectionLost) {
        warn!("{}", err);
    }
}

/// Server close frame; carries the auth result on legacy authorizers
pub(crate) fn on_close_frame(session: &mut Session, conn: ConnId, payload: &[u8]) -> Result<()> {
    let Some(kind) = session.connection(conn).map(|c| c.kind()) else {
        return Ok(());
    };
    match kind {
        ConnectionKind::Auth => {
            if payload.is_empty() {
                return Ok(());
            }
            let tlvs = TlvChain::decode(payload)?;
            if tlvs.contains(TLV_ERROR_CODE) || tlvs.contains(TLV_COOKIE) {
                handle_auth_result(session, conn, AuthResult::from_tlvs(&tlvs)?)?;
            }
            Ok(())
        }
        ConnectionKind::Main => {
            let reason = match close_reason(payload) {
                Some(REASON_SIGNED_ON_ELSEWHERE) => "signed-on-elsewhere".to_string(),
                Some(code) => format!("server closed the connection (reason 0x{:04x})", code),
                None => "server closed the connection".to_string(),
            };
            if session.login_state() == LoginState::Ready {
                end_session(session, reason);
            } else {
                warn!("Main connection closed during login: {}", reason);
                fail_login(session, LoginFailure::ConnectionFailed);
            }
            Ok(())
        }
        _ => {
            debug!("Server closed {} connection {}", kind, conn);
            session.close_connection(conn);
            Ok(())
        }
    }
}

// ----------------------------------------------------------------------------
// Authorizer
// ----------------------------------------------------------------------------

fn on_auth_connected(session: &mut Session, conn: ConnId, _event: &ConnectionEvent) -> Result<()> {
    let name = session
        .login_machine()
        .screen_name()
        .map(str::to_owned)
        .ok_or_else(|| OwlchatError::protocol("authorizer connected without credentials"))?;
    session.send_frame_urgent(conn, Frame::control_hello(&TlvChain::new())?)?;
    session.send(conn, outbound::key_request(&name)?)?;
    session.apply_login(LoginEvent::AuthConnected)?;
    Ok(())
}

fn on_auth_key(session: &mut Session, conn: ConnId, record: &Record, inbound: &Inbound) -> Result<()> {
    let Inbound::AuthKey { key } = inbound else {
        return Err(unexpected(session, record));
    };
    let credentials = session
        .login_machine()
        .credentials()
        .cloned()
        .ok_or_else(|| unexpected(session, record))?;
    let request = outbound::login_request(
        &credentials.screen_name,
        &credentials.password,
        key,
        &session.config().client,
    )?;
    session.send(conn, request)?;
    session.apply_login(LoginEvent::ChallengeReceived)?;
    Ok(())
}

fn on_auth_reply(session: &mut Session, conn: ConnId, record: &Record, inbound: &Inbound) -> Result<()> {
    let Inbound::AuthResult(result) = inbound else {
        return Err(unexpected(session, record));
    };
    handle_auth_result(session, conn, result.clone())
}

fn on_auth_error(session: &mut Session, _conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    let failure = match inbound {
        Inbound::ErrorReply { code: Some(code) } => LoginFailure::UnknownAuthError(*code),
        _ => LoginFailure::ProtocolError,
    };
    fail_login(session, failure);
    Ok(())
}

fn handle_auth_result(session: &mut Session, conn: ConnId, result: AuthResult) -> Result<()> {
    if session.login_state() == LoginState::SendingCredentials {
        session.apply_login(LoginEvent::CredentialsFlushed)?;
    }
    if session.login_state() != LoginState::AwaitingAuthResult {
        debug!("Ignoring auth result in {}", session.login_state());
        return Ok(());
    }

    match result {
        AuthResult::Failure { code, url } => {
            let failure = LoginFailure::from_auth_code(code);
            warn!("{}", AuthenticationError { code, failure, url });
            if failure == LoginFailure::ReconnectingTooFast {
                let cooldown = std::time::Duration::from_millis(session.config().reconnect.max_backoff_ms);
                let until = session.now() + cooldown;
                session.login_mut().cooldown_until = Some(until);
            }
            fail_login(session, failure);
            Ok(())
        }
        AuthResult::Success {
            screen_name,
            address,
            cookie,
        } => {
            info!("Authorized; main service at {}", address);
            session.close_connection(conn);
            if let Some(name) = screen_name {
                session.set_screen_name(name);
            }
            session.apply_login(LoginEvent::AuthSucceeded)?;
            if let Err(err) = session.open_connection(ConnectionKind::Main, &address, Some(cookie), None) {
                warn!("Main connection to {} failed: {}", address, err);
                fail_login(session, err.login_failure());
            }
            Ok(())
        }
    }
}

// ----------------------------------------------------------------------------
// Service Connections
// ----------------------------------------------------------------------------

fn on_service_connected(session: &mut Session, conn: ConnId, _event: &ConnectionEvent) -> Result<()> {
    let (kind, cookie) = match session.connection_mut(conn) {
        Some(connection) => (connection.kind(), connection.take_cookie()),
        None => return Ok(()),
    };
    let cookie =
        cookie.ok_or_else(|| OwlchatError::protocol(format!("{} connection has no cookie", kind)))?;
    session.send_frame_urgent(conn, Frame::cookie_login(cookie.as_bytes())?)?;
    set_phase(session, conn, ServicePhase::CookieSent);
    if kind == ConnectionKind::Main {
        session.apply_login(LoginEvent::MainConnected)?;
    }
    Ok(())
}

fn on_version(_session: &mut Session, conn: ConnId, event: &ConnectionEvent) -> Result<()> {
    if let ConnectionEvent::VersionNegotiated { version } = event {
        trace!("{} speaks protocol version {}", conn, version);
    }
    Ok(())
}

fn on_server_ready(session: &mut Session, conn: ConnId, record: &Record, inbound: &Inbound) -> Result<()> {
    let Inbound::ServerReady { families } = inbound else {
        return Err(unexpected(session, record));
    };
    if let Some(connection) = session.connection_mut(conn) {
        connection.set_families(families.clone());
    }
    session.send(conn, outbound::family_versions(families))?;
    set_phase(session, conn, ServicePhase::VersionsSent);
    Ok(())
}

fn on_versions_ack(session: &mut Session, conn: ConnId, _record: &Record, _inbound: &Inbound) -> Result<()> {
    session.send(conn, outbound::rate_request())?;
    set_phase(session, conn, ServicePhase::RateRequested);
    Ok(())
}

fn on_rate_info(session: &mut Session, conn: ConnId, record: &Record, inbound: &Inbound) -> Result<()> {
    let Inbound::RateInfo(info) = inbound else {
        return Err(unexpected(session, record));
    };
    let Some(connection) = session.connection_mut(conn) else {
        return Ok(());
    };
    connection.rates_mut().load(info);
    let kind = connection.kind();
    let families = connection.families().to_vec();
    debug!("{} has {} rate classes", conn, info.classes.len());
    session.send(conn, outbound::rate_ack(&info.class_ids()))?;

    match kind {
        ConnectionKind::Main => {
            let setup = [
                outbound::self_info_request(),
                outbound::locate_rights_request(),
                outbound::buddy_rights_request(),
                outbound::icbm_params_request(),
                outbound::bos_rights_request(),
                outbound::ssi_rights_request(),
                outbound::ssi_list_request(),
            ];
            for request in setup {
                session.send(conn, request)?;
            }
            set_phase(session, conn, ServicePhase::Setup);
        }
        ConnectionKind::ChatDirectory => {
            session.send(conn, outbound::client_ready(&families))?;
            session.send(conn, outbound::chat_nav_rights_request())?;
            set_phase(session, conn, ServicePhase::Online);
            services::flush_room_joins(session, conn)?;
        }
        _ => {
            session.send(conn, outbound::client_ready(&families))?;
            set_phase(session, conn, ServicePhase::Online);
            info!("{} service online on {}", kind, conn);
        }
    }
    Ok(())
}

fn on_ssi_list(session: &mut Session, conn: ConnId, record: &Record, inbound: &Inbound) -> Result<()> {
    let complete = match inbound {
        Inbound::SsiList(list) => {
            let complete = !record.has_more_replies();
            session.feedbag_mut().extend(list.items.clone(), complete);
            complete
        }
        Inbound::SsiUnchanged => {
            session.feedbag_mut().mark_received();
            true
        }
        _ => return Err(unexpected(session, record)),
    };
    let in_setup = session
        .connection(conn)
        .is_some_and(|c| c.phase() == ServicePhase::Setup);
    if complete && in_setup {
        finish_main_login(session, conn)?;
    }
    Ok(())
}

fn finish_main_login(session: &mut Session, conn: ConnId) -> Result<()> {
    let families = session
        .connection(conn)
        .map(|c| c.families().to_vec())
        .unwrap_or_default();
    session.send(conn, outbound::ssi_activate())?;
    session.send(conn, outbound::set_locate_info(None)?)?;
    session.send(conn, outbound::icbm_set_params())?;
    session.send(conn, outbound::client_ready(&families))?;
    set_phase(session, conn, ServicePhase::Online);
    session.apply_login(LoginEvent::ServicesReady)?;

    let login = session.login_mut();
    login.has_succeeded = true;
    login.auth_failures = 0;
    login.deadline = None;

    let name = session.screen_name().unwrap_or_default().to_string();
    info!("Signed on as {} with {} buddies", name, session.feedbag().buddies().len());
    session.notify(Notification::LoginSucceeded { name });
    Ok(())
}

fn on_rate_change(session: &mut Session, conn: ConnId, record: &Record, inbound: &Inbound) -> Result<()> {
    let Inbound::RateChange(change) = inbound else {
        return Err(unexpected(session, record));
    };
    let policy = session.config().rate_policy;
    let Some(connection) = session.connection_mut(conn) else {
        return Ok(());
    };
    let reaction = connection.rates_mut().apply(change, &policy);
    if reaction == RateReaction::Disconnect {
        return Err(TransportError::RateDisconnect {
            class: change.class.id,
        }
        .into());
    }
    let interval = connection.rates().min_send_interval();
    connection.set_min_send_interval(interval);
    match reaction {
        RateReaction::Throttle(spacing) => warn!(
            "{}: spacing sends on {} by {:?}",
            OwlchatError::RateLimited {
                class: change.class.id
            },
            conn,
            spacing
        ),
        _ => debug!("Rate class {} on {} now {:?}", change.class.id, conn, interval),
    }
    Ok(())
}

fn on_server_pause(session: &mut Session, conn: ConnId, record: &Record, inbound: &Inbound) -> Result<()> {
    let Inbound::ServerPause { families } = inbound else {
        return Err(unexpected(session, record));
    };
    session.send_urgent(conn, outbound::pause_ack(families))?;
    if let Some(connection) = session.connection_mut(conn) {
        connection.set_paused(true);
    }
    info!("Server paused {}", conn);
    Ok(())
}

fn on_server_resume(session: &mut Session, conn: ConnId, _record: &Record, _inbound: &Inbound) -> Result<()> {
    if let Some(connection) = session.connection_mut(conn) {
        connection.set_paused(false);
    }
    info!("Server resumed {}", conn);
    Ok(())
}

fn on_verify_request(session: &mut Session, conn: ConnId, record: &Record, inbound: &Inbound) -> Result<()> {
    let Inbound::VerifyRequest { offset, length } = inbound else {
        return Err(unexpected(session, record));
    };
    if session.client_binary().is_none() {
        debug!("No client binary cached; answering verification with the empty digest");
    }
    let digest = auth::verification_digest(session.client_binary(), *offset, *length);
    session.send(conn, outbound::verify_reply(&digest))?;
    Ok(())
}

fn on_motd(_session: &mut Session, conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    if let Inbound::Motd { kind, .. } = inbound {
        debug!("Message of the day type {} on {}", kind, conn);
    }
    Ok(())
}

fn on_service_error(_session: &mut Session, conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    if let Inbound::ErrorReply { code } = inbound {
        warn!("Service error {:?} on {}", code, conn);
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Main Connection Only
// ----------------------------------------------------------------------------

fn on_redirect(session: &mut Session, _conn: ConnId, record: &Record, inbound: &Inbound) -> Result<()> {
    let Inbound::Redirect(redirect) = inbound else {
        return Err(unexpected(session, record));
    };
    let Some(kind) = ConnectionKind::from_service_family(redirect.family) else {
        warn!("Redirect for unsupported family 0x{:04x}", redirect.family);
        return Ok(());
    };
    let (room, room_name) = match session.take_service_request(kind) {
        Some(request) => (request.room, request.room_name),
        None => {
            if kind == ConnectionKind::ChatRoom {
                warn!("Chat room redirect with no queued join");
            }
            (None, None)
        }
    };
    match session.open_connection(kind, &redirect.address, Some(redirect.cookie.clone()), room) {
        Ok(id) => {
            if let Some(name) = room_name {
                session.chat_mut().rooms.insert(id, name);
            }
        }
        Err(err) => {
            warn!("Redirect to {} failed: {}", redirect.address, err);
            session.notify(Notification::ProtocolError {
                detail: format!("could not open {} service: {}", kind, err),
            });
        }
    }
    Ok(())
}

fn on_self_info(session: &mut Session, _conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    if let Inbound::SelfInfo(info) = inbound {
        debug!("Self info for {}: warning level {}", info.screen_name, info.warning_level);
        session.set_self_info(info.clone());
    }
    Ok(())
}

fn on_warned(session: &mut Session, _conn: ConnId, record: &Record, inbound: &Inbound) -> Result<()> {
    let Inbound::Warned { new_level, by } = inbound else {
        return Err(unexpected(session, record));
    };
    session.notify(Notification::Warned {
        by: by.as_ref().map(|user| user.screen_name.clone()),
        new_level: *new_level,
    });
    Ok(())
}
