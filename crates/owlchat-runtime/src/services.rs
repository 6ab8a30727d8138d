//! Service handlers and user operations
//!
//! Everything that happens once a connection is online: presence,
//! instant messages, buddy list edits, lookups and chat rooms.

use owlchat_core::protocol::families::{self, buddy, bos, chat, chat_nav, icbm, locate, ssi};
use owlchat_core::protocol::icbm::{new_message_cookie, CHANNEL_IM, CHANNEL_RENDEZVOUS};
use owlchat_core::protocol::{outbound, SsiEdit, SsiItem, SsiOp};
use owlchat_core::{
    ConnectionKind, Inbound, MessageFlags, Notification, OwlchatError, Record, RegistryError,
    Result,
};
use tracing::{debug, info, trace, warn};

use crate::connection::ConnId;
use crate::dispatch::HandlerTable;
use crate::pending::Reply;
use crate::session::{RoomJoin, Session};

/// Install the service handlers a connection of `kind` needs
pub(crate) fn install(
    table: &mut HandlerTable,
    kind: ConnectionKind,
) -> core::result::Result<(), RegistryError> {
    match kind {
        ConnectionKind::Main => {
            table.register(families::BUDDY, buddy::ONCOMING, on_buddy_online)?;
            table.register(families::BUDDY, buddy::OFFGOING, on_buddy_offline)?;
            table.register(families::ICBM, icbm::INCOMING, on_incoming_icbm)?;
            table.register(families::ICBM, icbm::HOST_ACK, on_host_ack)?;
            table.register(families::SSI, ssi::ADD, on_ssi_push)?;
            table.register(families::SSI, ssi::MODIFY, on_ssi_push)?;
            table.register(families::SSI, ssi::DELETE, on_ssi_push)?;
            table.register(families::SSI, ssi::STATUS, on_ssi_status)?;
            table.register(families::SSI, ssi::EDIT_START, on_ssi_edit_boundary)?;
            table.register(families::SSI, ssi::EDIT_END, on_ssi_edit_boundary)?;
            table.register(families::LOCATE, locate::RIGHTS, on_rights)?;
            table.register(families::BUDDY, buddy::RIGHTS, on_rights)?;
            table.register(families::BOS, bos::RIGHTS, on_rights)?;
            table.register(families::SSI, ssi::RIGHTS, on_rights)?;
            table.register(families::ICBM, icbm::PARAMS, on_icbm_params)?;
        }
        ConnectionKind::ChatDirectory => {
            table.register(families::CHAT_NAV, chat_nav::INFO, on_chat_nav_info)?;
        }
        ConnectionKind::ChatRoom => {
            table.register(families::CHAT, chat::ROOM_INFO, on_room_info)?;
            table.register(families::CHAT, chat::USERS_JOINED, on_room_users)?;
            table.register(families::CHAT, chat::USERS_LEFT, on_room_users)?;
            table.register(families::CHAT, chat::INCOMING, on_chat_incoming)?;
        }
        _ => {}
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Presence and Messages
// ----------------------------------------------------------------------------

fn on_buddy_online(session: &mut Session, _conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    if let Inbound::BuddyOnline(user) = inbound {
        session.notify(Notification::BuddyOnline {
            name: user.screen_name.clone(),
            idle_seconds: user.idle_seconds(),
        });
    }
    Ok(())
}

fn on_buddy_offline(session: &mut Session, _conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    if let Inbound::BuddyOffline(user) = inbound {
        session.notify(Notification::BuddyOffline {
            name: user.screen_name.clone(),
        });
    }
    Ok(())
}

fn on_incoming_icbm(session: &mut Session, _conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    let Inbound::IncomingIcbm(message) = inbound else {
        return Ok(());
    };
    let from = message.sender.screen_name.clone();
    match message.channel {
        CHANNEL_IM => match message.message() {
            Ok((text, flags)) => session.notify(Notification::MessageReceived {
                from,
                text: text.text,
                flags,
            }),
            Err(err) => {
                warn!("Unreadable message from {}: {}", from, err);
                session.notify(Notification::ProtocolError {
                    detail: format!("unreadable message from {}: {}", from, err),
                });
            }
        },
        CHANNEL_RENDEZVOUS => info!("Ignoring rendezvous proposal from {}", from),
        other => debug!("Ignoring channel {} message from {}", other, from),
    }
    Ok(())
}

fn on_host_ack(_session: &mut Session, _conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    if let Inbound::MessageAcked { to, .. } = inbound {
        trace!("Server accepted message to {}", to);
    }
    Ok(())
}

/// Send an instant message on the main connection
pub(crate) fn send_message(session: &mut Session, target: &str, text: &str, flags: MessageFlags) -> Result<()> {
    if target.trim().is_empty() {
        return Err(OwlchatError::invalid_argument("message target cannot be empty"));
    }
    let main = session.main_ready()?;
    let record = outbound::send_im(target, text, flags, new_message_cookie())?;
    session.send(main, record)?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Buddy List
// ----------------------------------------------------------------------------

fn on_ssi_push(session: &mut Session, _conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    let Inbound::SsiPush { op, items } = inbound else {
        return Ok(());
    };
    let feedbag = session.feedbag_mut();
    for item in items {
        match op {
            SsiOp::Add | SsiOp::Modify => feedbag.upsert(item.clone()),
            SsiOp::Delete => feedbag.remove(item),
        }
    }
    debug!("Server pushed {:?} of {} list items", op, items.len());
    Ok(())
}

fn on_ssi_status(session: &mut Session, _conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    let Inbound::SsiStatus { codes } = inbound else {
        return Ok(());
    };
    for code in codes.iter().filter(|code| **code != 0) {
        warn!("Buddy list edit rejected with status 0x{:04x}", code);
        session.notify(Notification::ProtocolError {
            detail: format!("buddy list edit rejected (status 0x{:04x})", code),
        });
    }
    Ok(())
}

fn on_ssi_edit_boundary(_session: &mut Session, conn: ConnId, record: &Record, _inbound: &Inbound) -> Result<()> {
    trace!("List edit boundary 0x{:04x} on {}", record.subtype, conn);
    Ok(())
}

fn on_rights(_session: &mut Session, conn: ConnId, record: &Record, inbound: &Inbound) -> Result<()> {
    if let Inbound::Rights { tlvs } = inbound {
        debug!(
            "Family 0x{:04x} rights on {}: {} limits",
            record.family,
            conn,
            tlvs.len()
        );
    }
    Ok(())
}

fn on_icbm_params(_session: &mut Session, _conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    if let Inbound::IcbmParams(params) = inbound {
        debug!(
            "Message limits: {} bytes, {}ms between messages",
            params.max_message_len, params.min_interval
        );
    }
    Ok(())
}

/// Consecutive edits with the same operation, in order
fn batch_edits(edits: Vec<SsiEdit>) -> Vec<(SsiOp, Vec<SsiItem>)> {
    let mut batches: Vec<(SsiOp, Vec<SsiItem>)> = Vec::new();
    for edit in edits {
        match batches.last_mut() {
            Some((op, items)) if *op == edit.op => items.push(edit.item),
            _ => batches.push((edit.op, vec![edit.item])),
        }
    }
    batches
}

fn send_edits(session: &mut Session, main: ConnId, edits: Vec<SsiEdit>) -> Result<()> {
    if edits.is_empty() {
        return Ok(());
    }
    session.send(main, outbound::ssi_edit_start())?;
    for (op, items) in batch_edits(edits) {
        session.send(main, outbound::ssi_items(op, &items)?)?;
    }
    session.send(main, outbound::ssi_edit_end())?;
    Ok(())
}

pub(crate) fn add_buddy(session: &mut Session, name: &str, group: &str) -> Result<()> {
    if name.trim().is_empty() || group.trim().is_empty() {
        return Err(OwlchatError::invalid_argument("buddy and group names cannot be empty"));
    }
    let main = session.main_ready()?;
    let edits = session.feedbag_mut().plan_add_buddy(name, group)?;
    if edits.is_empty() {
        debug!("{} is already in {}", name, group);
    }
    send_edits(session, main, edits)
}

pub(crate) fn remove_buddy(session: &mut Session, name: &str, group: &str) -> Result<()> {
    let main = session.main_ready()?;
    let edits = session.feedbag_mut().plan_remove_buddy(name, group)?;
    send_edits(session, main, edits)
}

// ----------------------------------------------------------------------------
// Lookups
// ----------------------------------------------------------------------------

/// Search for screen names registered to `address`
pub(crate) fn search_by_email(session: &mut Session, address: &str) -> Result<()> {
    let main = session.main_ready()?;
    let address = address.to_string();
    let record = outbound::search_by_email(&address);
    session.send_request(main, record, move |session, reply| {
        match reply {
            Ok(Reply {
                inbound: Inbound::SearchReply { names },
                ..
            }) => session.notify(Notification::SearchResult { address, names }),
            Ok(other) => {
                debug!("Search for {} returned {:?}", address, other.inbound);
                session.notify(Notification::SearchResult {
                    address,
                    names: Vec::new(),
                });
            }
            Err(err @ OwlchatError::Timeout { .. }) => {
                session.notify(Notification::SearchResult {
                    address: address.clone(),
                    names: Vec::new(),
                });
                session.notify(Notification::ProtocolError {
                    detail: format!("search for {} failed: {}", address, err),
                });
            }
            Err(err) => debug!("Search for {} abandoned: {}", address, err),
        }
        Ok(())
    })?;
    Ok(())
}

/// Fetch profile and away message for `name`
pub(crate) fn get_user_info(session: &mut Session, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(OwlchatError::invalid_argument("screen name cannot be empty"));
    }
    let main = session.main_ready()?;
    let name = name.to_string();
    let record = outbound::user_info_request(&name)?;
    session.send_request(main, record, move |session, reply| {
        match reply {
            Ok(Reply {
                inbound: Inbound::LocateReply(info),
                ..
            }) => session.notify(Notification::UserInfo {
                name: info.user.screen_name.clone(),
                warning_level: info.user.warning_level,
                idle_seconds: info.user.idle_seconds(),
                profile: info.profile,
                away_message: info.away_message,
            }),
            Ok(Reply {
                inbound: Inbound::ErrorReply { code },
                ..
            }) => session.notify(Notification::ProtocolError {
                detail: format!("no user info for {} (error {:?})", name, code),
            }),
            Ok(other) => debug!("Unexpected user info reply {:?}", other.record.key()),
            Err(err @ OwlchatError::Timeout { .. }) => session.notify(Notification::ProtocolError {
                detail: format!("user info for {} failed: {}", name, err),
            }),
            Err(err) => debug!("User info for {} abandoned: {}", name, err),
        }
        Ok(())
    })?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Chat Rooms
// ----------------------------------------------------------------------------

/// Join (creating if needed) the room `name` on `exchange`
pub(crate) fn join_room(session: &mut Session, name: &str, exchange: u16) -> Result<()> {
    if name.trim().is_empty() {
        return Err(OwlchatError::invalid_argument("room name cannot be empty"));
    }
    session.main_ready()?;
    let join = RoomJoin {
        name: name.to_string(),
        exchange,
    };
    if let Some(directory) = session.online_connection(ConnectionKind::ChatDirectory) {
        return request_room(session, directory, join);
    }
    session.chat_mut().joins.push_back(join);
    if let Some(directory) = session.open_service(ConnectionKind::ChatDirectory)? {
        debug!("Room join queued until {} is online", directory);
    }
    Ok(())
}

/// Send every queued join to the now-online chat directory
pub(crate) fn flush_room_joins(session: &mut Session, directory: ConnId) -> Result<()> {
    while let Some(join) = session.chat_mut().joins.pop_front() {
        request_room(session, directory, join)?;
    }
    Ok(())
}

fn request_room(session: &mut Session, directory: ConnId, join: RoomJoin) -> Result<()> {
    let record = outbound::chat_create_room(join.exchange, &join.name)?;
    session.send_request(directory, record, move |session, reply| match reply {
        Ok(Reply {
            inbound: Inbound::ChatNavInfo { rooms },
            ..
        }) => match rooms.into_iter().next() {
            Some(room) => {
                let name = room.name().unwrap_or(join.name);
                info!("Room {} granted; requesting connection", name);
                session.open_room(room.key, name)
            }
            None => {
                session.notify(Notification::ProtocolError {
                    detail: format!("chat directory returned no room for {}", join.name),
                });
                Ok(())
            }
        },
        Ok(other) => {
            session.notify(Notification::ProtocolError {
                detail: format!("could not join {}: {:?}", join.name, other.inbound),
            });
            Ok(())
        }
        Err(err @ OwlchatError::Timeout { .. }) => {
            session.notify(Notification::ProtocolError {
                detail: format!("could not join {}: {}", join.name, err),
            });
            Ok(())
        }
        Err(err) => {
            debug!("Join of {} abandoned: {}", join.name, err);
            Ok(())
        }
    })?;
    Ok(())
}

fn find_room(session: &Session, room: &str) -> Result<ConnId> {
    session
        .rooms()
        .find(|(_, name)| name.eq_ignore_ascii_case(room))
        .map(|(id, _)| id)
        .ok_or(OwlchatError::NotConnected {
            kind: ConnectionKind::ChatRoom,
        })
}

pub(crate) fn send_chat_message(session: &mut Session, room: &str, text: &str) -> Result<()> {
    let conn = find_room(session, room)?;
    let record = outbound::chat_send(text, new_message_cookie())?;
    session.send(conn, record)?;
    Ok(())
}

pub(crate) fn leave_room(session: &mut Session, room: &str) -> Result<()> {
    let conn = find_room(session, room)?;
    session.close_connection(conn);
    let chat = session.chat_mut();
    chat.rooms.remove(&conn);
    chat.announced.remove(&conn);
    info!("Left room {}", room);
    Ok(())
}

fn on_chat_nav_info(_session: &mut Session, conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    if let Inbound::ChatNavInfo { rooms } = inbound {
        debug!("Chat directory info on {}: {} rooms", conn, rooms.len());
    }
    Ok(())
}

fn room_label(session: &Session, conn: ConnId) -> String {
    session
        .room_name(conn)
        .map(str::to_owned)
        .unwrap_or_else(|| conn.to_string())
}

fn on_room_info(session: &mut Session, conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    let Inbound::ChatRoomInfo(info) = inbound else {
        return Ok(());
    };
    if session.room_name(conn).is_none() {
        if let Some(name) = info.name() {
            session.chat_mut().rooms.insert(conn, name);
        }
    }
    if session.chat_mut().announced.insert(conn) {
        let room = room_label(session, conn);
        info!("Joined room {}", room);
        session.notify(Notification::ChatJoined { room });
    }
    Ok(())
}

fn on_room_users(session: &mut Session, conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    let room = room_label(session, conn);
    match inbound {
        Inbound::ChatUsersJoined(users) => session.notify(Notification::ChatUsersJoined {
            room,
            names: users.iter().map(|user| user.screen_name.clone()).collect(),
        }),
        Inbound::ChatUsersLeft(users) => session.notify(Notification::ChatUsersLeft {
            room,
            names: users.iter().map(|user| user.screen_name.clone()).collect(),
        }),
        _ => {}
    }
    Ok(())
}

fn on_chat_incoming(session: &mut Session, conn: ConnId, _record: &Record, inbound: &Inbound) -> Result<()> {
    let Inbound::ChatIncoming(message) = inbound else {
        return Ok(());
    };
    let room = room_label(session, conn);
    session.notify(Notification::ChatMessage {
        room,
        from: message
            .sender
            .as_ref()
            .map(|user| user.screen_name.clone())
            .unwrap_or_default(),
        text: message.text.clone(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(op: SsiOp, name: &str) -> SsiEdit {
        SsiEdit {
            op,
            item: SsiItem::buddy(name, 1, 1),
        }
    }

    #[test]
    fn test_batch_edits_groups_consecutive_ops() {
        let batches = batch_edits(vec![
            edit(SsiOp::Add, "a"),
            edit(SsiOp::Add, "b"),
            edit(SsiOp::Modify, "group"),
            edit(SsiOp::Add, "c"),
        ]);
        let shape: Vec<(SsiOp, usize)> = batches.iter().map(|(op, items)| (*op, items.len())).collect();
        assert_eq!(
            shape,
            vec![(SsiOp::Add, 2), (SsiOp::Modify, 1), (SsiOp::Add, 1)]
        );
    }

    #[test]
    fn test_batch_edits_empty() {
        assert!(batch_edits(Vec::new()).is_empty());
    }
}
