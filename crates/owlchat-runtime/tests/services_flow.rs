//! Post-login scenarios: messaging, presence, lookups, rates and chat

mod common;

use std::time::Duration;

use common::*;
use owlchat_core::protocol::families::{self, chat, generic, icbm, locate, lookup, ssi};
use owlchat_core::protocol::inbound::{TLV_PROFILE, TLV_SEARCH_NAME};
use owlchat_core::protocol::{Channel, Record, Tlv, TlvChain, WireWrite};
use owlchat_core::{
    ConnectionKind, MessageFlags, Notification, OwlchatError, RateCode, RegistryError,
};
use owlchat_runtime::{LoginState, DEFAULT_GROUP};

fn online() -> Harness {
    let mut h = Harness::new();
    let notes = h.login();
    assert!(matches!(
        notes.as_slice(),
        [Notification::LoginSucceeded { .. }]
    ));
    h
}

fn sent(h: &Harness, kind: ConnectionKind, family: u16, subtype: u16) -> Vec<Record> {
    with_key(&h.endpoint(kind).take_records(), family, subtype)
}

// ----------------------------------------------------------------------------
// Messages and Presence
// ----------------------------------------------------------------------------

#[test]
fn test_incoming_message() {
    let mut h = online();
    h.push(ConnectionKind::Main, incoming_text("bob", "hello there"));
    assert_eq!(
        h.notifications(),
        vec![Notification::MessageReceived {
            from: "bob".into(),
            text: "hello there".into(),
            flags: MessageFlags::NONE,
        }]
    );
}

#[test]
fn test_malformed_message_body_is_reported() {
    let mut h = online();
    h.push(ConnectionKind::Main, incoming_im("bob", vec![0x05]));
    let notes = h.notifications();
    assert_eq!(notes.len(), 1);
    assert!(matches!(&notes[0], Notification::ProtocolError { detail } if detail.contains("bob")));
    assert_eq!(h.engine.login_state(), LoginState::Ready);
}

#[test]
fn test_send_message() {
    let mut h = online();
    h.engine.send_message("bob", "hi", MessageFlags::NONE).unwrap();
    h.step();
    assert_eq!(sent(&h, ConnectionKind::Main, families::ICBM, icbm::SEND).len(), 1);
    assert!(h.engine.send_message(" ", "hi", MessageFlags::NONE).is_err());
}

#[test]
fn test_buddy_presence() {
    let mut h = online();
    h.push(ConnectionKind::Main, buddy_online("bob", Some(3)));
    h.push(ConnectionKind::Main, buddy_online("carol", None));
    h.push(ConnectionKind::Main, buddy_offline("bob"));
    assert_eq!(
        h.notifications(),
        vec![
            Notification::BuddyOnline {
                name: "bob".into(),
                idle_seconds: 180
            },
            Notification::BuddyOnline {
                name: "carol".into(),
                idle_seconds: 0
            },
            Notification::BuddyOffline { name: "bob".into() },
        ]
    );
}

#[test]
fn test_warnings() {
    let mut h = online();
    h.push(ConnectionKind::Main, warned(120, Some("bob")));
    h.push(ConnectionKind::Main, warned(150, None));
    assert_eq!(
        h.notifications(),
        vec![
            Notification::Warned {
                by: Some("bob".into()),
                new_level: 120
            },
            Notification::Warned {
                by: None,
                new_level: 150
            },
        ]
    );
}

// ----------------------------------------------------------------------------
// Buddy List
// ----------------------------------------------------------------------------

#[test]
fn test_add_buddy_wraps_edits() {
    let mut h = online();
    h.engine.add_buddy("bob", DEFAULT_GROUP).unwrap();
    h.step();

    let records = h.endpoint(ConnectionKind::Main).take_records();
    let keys: Vec<(u16, u16)> = records.iter().map(Record::key).collect();
    assert_eq!(keys.first(), Some(&(families::SSI, ssi::EDIT_START)));
    assert_eq!(keys.last(), Some(&(families::SSI, ssi::EDIT_END)));
    assert!(keys.contains(&(families::SSI, ssi::ADD)));
    assert!(h
        .engine
        .session()
        .feedbag()
        .buddies()
        .contains(&"bob".to_string()));

    assert!(matches!(
        h.engine.add_buddy("bob", DEFAULT_GROUP),
        Err(OwlchatError::InvalidArgument { .. })
    ));
}

#[test]
fn test_remove_buddy() {
    let mut h = online();
    h.engine.add_buddy("bob", DEFAULT_GROUP).unwrap();
    h.step();
    h.endpoint(ConnectionKind::Main).take_records();

    h.engine.remove_buddy("bob", DEFAULT_GROUP).unwrap();
    h.step();
    assert_eq!(sent(&h, ConnectionKind::Main, families::SSI, ssi::DELETE).len(), 1);
    assert!(h.engine.session().feedbag().buddies().is_empty());
}

// ----------------------------------------------------------------------------
// Lookups and Pending Requests
// ----------------------------------------------------------------------------

#[test]
fn test_search_by_email_reply() {
    let mut h = online();
    h.engine.search_by_email("bob@example.com").unwrap();
    h.step();
    let request = sent(&h, ConnectionKind::Main, families::USER_LOOKUP, lookup::SEARCH_EMAIL);
    assert_eq!(request.len(), 1);

    let tlvs = TlvChain::new()
        .with(Tlv::string(TLV_SEARCH_NAME, "bob").unwrap())
        .with(Tlv::string(TLV_SEARCH_NAME, "bobby").unwrap());
    let reply = Record::new(families::USER_LOOKUP, lookup::SEARCH_REPLY, tlvs.encode())
        .with_request_id(request[0].request_id);
    h.push(ConnectionKind::Main, reply);

    assert_eq!(
        h.notifications(),
        vec![Notification::SearchResult {
            address: "bob@example.com".into(),
            names: vec!["bob".into(), "bobby".into()],
        }]
    );
    assert!(h.engine.session().pending().is_empty());
}

#[test]
fn test_search_times_out_once() {
    let mut h = online();
    h.engine.search_by_email("nobody@example.com").unwrap();
    h.step();

    h.advance(Duration::from_millis(4_900));
    assert!(h.notifications().is_empty());

    let mut fired = Vec::new();
    for _ in 0..30 {
        h.advance(Duration::from_millis(10));
        for note in h.notifications() {
            fired.push((h.now().as_millis(), note));
        }
    }

    assert_eq!(fired.len(), 2);
    let (at, first) = &fired[0];
    assert!((5_000..=5_050).contains(at));
    assert_eq!(
        first,
        &Notification::SearchResult {
            address: "nobody@example.com".into(),
            names: Vec::new(),
        }
    );
    assert!(matches!(fired[1].1, Notification::ProtocolError { .. }));
    assert_eq!(h.engine.session().stats().requests_timed_out, 1);
    assert!(h.engine.session().pending().is_empty());
}

#[test]
fn test_user_info() {
    let mut h = online();
    h.engine.get_user_info("bob").unwrap();
    h.step();
    let request = sent(&h, ConnectionKind::Main, families::LOCATE, locate::INFO_REQUEST);
    assert_eq!(request.len(), 1);

    let mut payload = user("bob", Some(2)).encode().unwrap();
    let tlvs = TlvChain::new().with(Tlv::string(TLV_PROFILE, "likes owls").unwrap());
    payload.extend_from_slice(&tlvs.encode());
    let reply = Record::new(families::LOCATE, locate::INFO_REPLY, payload)
        .with_request_id(request[0].request_id);
    h.push(ConnectionKind::Main, reply);

    assert_eq!(
        h.notifications(),
        vec![Notification::UserInfo {
            name: "bob".into(),
            warning_level: 0,
            idle_seconds: 120,
            profile: Some("likes owls".into()),
            away_message: None,
        }]
    );
}

#[test]
fn test_user_info_error_reply() {
    let mut h = online();
    h.engine.get_user_info("ghost").unwrap();
    h.step();
    let request = sent(&h, ConnectionKind::Main, families::LOCATE, locate::INFO_REQUEST);

    let mut payload = Vec::new();
    payload.put_u16(0x0004);
    let reply = Record::new(families::LOCATE, families::ERROR, payload)
        .with_request_id(request[0].request_id);
    h.push(ConnectionKind::Main, reply);

    let notes = h.notifications();
    assert_eq!(notes.len(), 1);
    assert!(matches!(&notes[0], Notification::ProtocolError { detail } if detail.contains("ghost")));
}

#[test]
fn test_unknown_record_is_counted() {
    let mut h = online();
    let before = h.engine.session().stats().unhandled_records;
    h.push(ConnectionKind::Main, Record::new(0x0042, 0x0007, vec![1, 2, 3]));
    assert_eq!(h.engine.session().stats().unhandled_records, before + 1);
    assert!(h.notifications().is_empty());

    let stats = serde_json::to_value(h.engine.session().stats()).unwrap();
    assert_eq!(stats["unhandled_records"], serde_json::json!(before + 1));
    assert_eq!(h.engine.login_state(), LoginState::Ready);
}

// ----------------------------------------------------------------------------
// Rates, Pause and Verification
// ----------------------------------------------------------------------------

#[test]
fn test_limit_spaces_messages_until_cleared() {
    let mut h = online();
    h.advance(Duration::from_secs(10));
    h.push(ConnectionKind::Main, rate_change(RateCode::Limit, 1_400));

    for text in ["one", "two", "three"] {
        h.engine.send_message("bob", text, MessageFlags::NONE).unwrap();
    }
    h.step();
    assert_eq!(sent(&h, ConnectionKind::Main, families::ICBM, icbm::SEND).len(), 1);

    h.advance(Duration::from_millis(1_999));
    assert!(sent(&h, ConnectionKind::Main, families::ICBM, icbm::SEND).is_empty());
    h.advance(Duration::from_millis(1));
    assert_eq!(sent(&h, ConnectionKind::Main, families::ICBM, icbm::SEND).len(), 1);

    h.push(ConnectionKind::Main, rate_change(RateCode::Cleared, 3_000));
    assert_eq!(sent(&h, ConnectionKind::Main, families::ICBM, icbm::SEND).len(), 1);
    assert!(h.notifications().is_empty());
}

#[test]
fn test_change_below_alert_spaces_messages() {
    let mut h = online();
    h.advance(Duration::from_secs(10));
    h.push(ConnectionKind::Main, rate_change(RateCode::Changed, 1_900));

    for text in ["one", "two"] {
        h.engine.send_message("bob", text, MessageFlags::NONE).unwrap();
    }
    h.step();
    assert_eq!(sent(&h, ConnectionKind::Main, families::ICBM, icbm::SEND).len(), 1);

    h.advance(Duration::from_millis(999));
    assert!(sent(&h, ConnectionKind::Main, families::ICBM, icbm::SEND).is_empty());
    h.advance(Duration::from_millis(1));
    assert_eq!(sent(&h, ConnectionKind::Main, families::ICBM, icbm::SEND).len(), 1);

    // Back above the clear level sends go out unspaced
    h.push(ConnectionKind::Main, rate_change(RateCode::Changed, 2_600));
    for text in ["three", "four"] {
        h.engine.send_message("bob", text, MessageFlags::NONE).unwrap();
    }
    h.step();
    assert_eq!(sent(&h, ConnectionKind::Main, families::ICBM, icbm::SEND).len(), 2);
    assert!(h.notifications().is_empty());
}

#[test]
fn test_rate_disconnect_ends_session() {
    let mut h = online();
    h.push(ConnectionKind::Main, rate_change(RateCode::Limit, 500));

    let notes = h.notifications();
    assert_eq!(notes.len(), 1);
    assert!(matches!(notes[0], Notification::Disconnected { .. }));
    assert_eq!(h.engine.login_state(), LoginState::Disconnected);
}

#[test]
fn test_pause_holds_messages_until_resume() {
    let mut h = online();
    let mut families_paused = Vec::new();
    families_paused.put_u16(families::ICBM);
    h.push(
        ConnectionKind::Main,
        Record::new(families::GENERIC, generic::SERVER_PAUSE, families_paused),
    );
    h.engine.send_message("bob", "held", MessageFlags::NONE).unwrap();
    h.step();

    let records = h.endpoint(ConnectionKind::Main).take_records();
    assert_eq!(with_key(&records, families::GENERIC, generic::PAUSE_ACK).len(), 1);
    assert!(with_key(&records, families::ICBM, icbm::SEND).is_empty());

    h.push(
        ConnectionKind::Main,
        Record::new(families::GENERIC, generic::SERVER_RESUME, Vec::new()),
    );
    assert_eq!(sent(&h, ConnectionKind::Main, families::ICBM, icbm::SEND).len(), 1);
}

#[test]
fn test_verification_without_client_binary() {
    let mut h = online();
    let mut payload = Vec::new();
    payload.put_u32(0x0000_1000);
    payload.put_u32(0x0000_0100);
    h.push(
        ConnectionKind::Main,
        Record::new(families::GENERIC, generic::VERIFY_REQUEST, payload),
    );

    let replies = sent(&h, ConnectionKind::Main, families::GENERIC, generic::VERIFY_REPLY);
    assert_eq!(replies.len(), 1);
    let mut expected = vec![0x00, 0x10];
    expected.extend_from_slice(&hex::decode("d41d8cd98f00b204e9800998ecf8427e").unwrap());
    assert_eq!(replies[0].payload, expected);
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

#[test]
fn test_duplicate_registration_rejected() {
    let mut h = online();
    let main = h.engine.session().main_ready().unwrap();
    let connection = h.engine.session_mut().connection_mut(main).unwrap();
    let err = connection
        .handlers_mut()
        .register(families::GENERIC, generic::SELF_INFO, |_, _, _, _| Ok(()))
        .unwrap_err();
    assert_eq!(
        err,
        RegistryError::DuplicateHandler {
            family: families::GENERIC,
            subtype: generic::SELF_INFO
        }
    );
}

#[test]
fn test_panicking_handler_is_contained() {
    let mut h = online();
    let main = h.engine.session().main_ready().unwrap();
    h.engine
        .session_mut()
        .connection_mut(main)
        .unwrap()
        .handlers_mut()
        .register(0x0042, 0x0009, |_, _, _, _| panic!("handler bug"))
        .unwrap();

    h.push(ConnectionKind::Main, Record::new(0x0042, 0x0009, Vec::new()));
    let notes = h.notifications();
    assert_eq!(notes.len(), 1);
    assert!(matches!(notes[0], Notification::Disconnected { .. }));

    let notes = h.login();
    assert!(matches!(
        notes.as_slice(),
        [Notification::LoginSucceeded { .. }]
    ));
}

// ----------------------------------------------------------------------------
// Chat
// ----------------------------------------------------------------------------

#[test]
fn test_chat_room_lifecycle() {
    let mut h = online();
    assert!(h.join_room("lobby").is_empty());

    let chat_end = h.endpoint(ConnectionKind::ChatRoom);
    assert_eq!(chat_end.address(), CHAT_ADDRESS);
    let frames = chat_end.take_frames();
    assert_eq!(frames[0].channel(), Channel::Control);
    let (_, rest) = frames[0].control_version().unwrap();
    let cookie = TlvChain::decode(rest).unwrap();
    assert_eq!(cookie.get(0x0006, 0).unwrap().value(), b"K");

    h.bring_online(ConnectionKind::ChatRoom, &[families::GENERIC, families::CHAT]);
    h.push(ConnectionKind::ChatRoom, room_info("lobby"));
    h.push(ConnectionKind::ChatRoom, room_info("lobby"));
    h.push(ConnectionKind::ChatRoom, chat_users(chat::USERS_JOINED, &["bob", "carol"]));
    h.push(ConnectionKind::ChatRoom, chat_incoming("bob", "hoot"));
    h.push(ConnectionKind::ChatRoom, chat_users(chat::USERS_LEFT, &["carol"]));

    assert_eq!(
        h.notifications(),
        vec![
            Notification::ChatJoined {
                room: "lobby".into()
            },
            Notification::ChatUsersJoined {
                room: "lobby".into(),
                names: vec!["bob".into(), "carol".into()],
            },
            Notification::ChatMessage {
                room: "lobby".into(),
                from: "bob".into(),
                text: "hoot".into(),
            },
            Notification::ChatUsersLeft {
                room: "lobby".into(),
                names: vec!["carol".into()],
            },
        ]
    );

    h.engine.send_chat_message("LOBBY", "hello owls").unwrap();
    h.step();
    assert_eq!(sent(&h, ConnectionKind::ChatRoom, families::CHAT, chat::SEND).len(), 1);

    h.engine.leave_room("lobby").unwrap();
    h.step();
    assert!(chat_end.is_closed_by_client());
    assert!(matches!(
        h.engine.send_chat_message("lobby", "anyone?"),
        Err(OwlchatError::NotConnected {
            kind: ConnectionKind::ChatRoom
        })
    ));
    assert_eq!(h.engine.login_state(), LoginState::Ready);
}

#[test]
fn test_second_join_reuses_directory() {
    let mut h = online();
    h.join_room("lobby");
    let directories = h.network.endpoints_for(ConnectionKind::ChatDirectory).len();

    h.engine.join_room("attic", 4).unwrap();
    h.step();
    let creates = sent(
        &h,
        ConnectionKind::ChatDirectory,
        families::CHAT_NAV,
        families::chat_nav::CREATE,
    );
    assert_eq!(creates.len(), 1);
    assert_eq!(h.network.endpoints_for(ConnectionKind::ChatDirectory).len(), directories);
}

#[test]
fn test_join_requires_login() {
    let mut h = Harness::new();
    assert!(matches!(
        h.engine.join_room("lobby", 4),
        Err(OwlchatError::NotConnected {
            kind: ConnectionKind::Main
        })
    ));
    h.step();
    assert_eq!(h.network.connect_count(), 0);
}
