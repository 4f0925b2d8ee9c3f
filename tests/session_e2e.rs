//! End-to-end device protocol scenarios over loopback TCP.

mod common;

use std::time::Duration;

use serde_json::json;
use time::OffsetDateTime;

use courier::broker::BrokerSending;
use courier::protocol::ServerMessage;
use courier::session::SessionConfig;
use courier::store::{ChannelId, PendingStore};

use common::{TestClient, quick_session_config, start_server, wait_until};

fn future() -> OffsetDateTime {
    OffsetDateTime::now_utc() + time::Duration::hours(9)
}

fn seed_system(server: &common::TestServer) {
    for i in 3..=5 {
        server
            .store
            .append_to_channel(&ChannelId::system(), json!({"a": i}), future())
            .unwrap();
    }
}

#[test]
fn catch_up_on_connect() {
    let server = start_server(quick_session_config());
    seed_system(&server);

    let (mut client, params) =
        TestClient::connect(server.addr, "DEV-CATCHUP", &[("0", 2)], &[("model", "m1")]);
    assert_eq!(params.exchange_timeout_ms, 2_000);

    assert_eq!(
        client.recv(),
        ServerMessage::ConnBroadcast {
            chan_id: "0".to_string(),
            top_level: 3,
            payloads: vec![json!({"a": 5})],
        }
    );
    client.ack();

    // The acked level sticks: the next broadcast delivers only the new
    // append, not the already-seen tail.
    server
        .store
        .append_to_channel(&ChannelId::system(), json!({"x": 1}), future())
        .unwrap();
    server.broker.broadcast(&ChannelId::system());
    assert_eq!(
        client.recv(),
        ServerMessage::Broadcast {
            chan_id: "0".to_string(),
            top_level: 4,
            payloads: vec![json!({"x": 1})],
        }
    );
    client.ack();
}

#[test]
fn client_ahead_of_store_gets_only_last() {
    let server = start_server(quick_session_config());
    seed_system(&server);

    let (mut client, _) =
        TestClient::connect(server.addr, "DEV-AHEAD", &[("0", 10)], &[("model", "m1")]);

    assert_eq!(
        client.recv(),
        ServerMessage::ConnBroadcast {
            chan_id: "0".to_string(),
            top_level: 3,
            payloads: vec![json!({"a": 5})],
        }
    );
    client.ack();
}

#[test]
fn duplicate_connect_supersedes_first_session() {
    let server = start_server(quick_session_config());

    let (mut first, _) = TestClient::connect(server.addr, "DEV-DUP", &[], &[]);
    let ServerMessage::ConnBroadcast { .. } = first.recv() else {
        panic!("expected initial catch-up");
    };
    first.ack();
    wait_until("first session registered", || {
        server.broker.session_count() == 1
    });

    let (mut second, _) = TestClient::connect(server.addr, "DEV-DUP", &[], &[]);
    let ServerMessage::ConnBroadcast { .. } = second.recv() else {
        panic!("expected catch-up for the superseding session");
    };
    second.ack();

    // The first session was killed; its connection dies.
    assert!(first.try_recv().is_err());

    // The superseding session stays routable.
    server
        .store
        .append_to_channel(&ChannelId::system(), json!({"x": 1}), future())
        .unwrap();
    server.broker.broadcast(&ChannelId::system());
    let ServerMessage::Broadcast { top_level, .. } = second.recv() else {
        panic!("expected broadcast for the live session");
    };
    assert_eq!(top_level, 1);
    second.ack();
    assert_eq!(server.broker.session_count(), 1);
}

#[test]
fn broadcast_fans_out_to_all_connected_devices() {
    let server = start_server(quick_session_config());

    let (mut c1, _) = TestClient::connect(server.addr, "DEV-F1", &[("0", 0)], &[("model", "m1")]);
    let (mut c2, _) = TestClient::connect(server.addr, "DEV-F2", &[("0", 0)], &[("model", "m1")]);
    let ServerMessage::ConnBroadcast { .. } = c1.recv() else {
        panic!("expected catch-up");
    };
    c1.ack();
    let ServerMessage::ConnBroadcast { .. } = c2.recv() else {
        panic!("expected catch-up");
    };
    c2.ack();

    server
        .store
        .append_to_channel(&ChannelId::system(), json!({"x": 1}), future())
        .unwrap();
    server.broker.broadcast(&ChannelId::system());

    for client in [&mut c1, &mut c2] {
        assert_eq!(
            client.recv(),
            ServerMessage::Broadcast {
                chan_id: "0".to_string(),
                top_level: 1,
                payloads: vec![json!({"x": 1})],
            }
        );
        client.ack();
    }
}

#[test]
fn unicast_delivery_and_idempotent_ack() {
    let server = start_server(quick_session_config());
    let mailbox = ChannelId::unicast("DEV-U", "DEV-U");

    // Two identical appends with one server-side msg id: one stored entry.
    for _ in 0..2 {
        server
            .store
            .append_to_unicast_channel(&mailbox, "app1", json!({"m": 1}), "msg-1", future())
            .unwrap();
    }

    // The pending mailbox is replayed right after the connect catch-up.
    let (mut client, _) = TestClient::connect(server.addr, "DEV-U", &[], &[]);
    let ServerMessage::ConnBroadcast { .. } = client.recv() else {
        panic!("expected catch-up");
    };
    client.ack();
    let ServerMessage::Notifications { notifications } = client.recv() else {
        panic!("expected pending unicast replay");
    };
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].msg_id.as_deref(), Some("msg-1"));
    client.ack_msg_ids(&["msg-1"]);

    wait_until("acknowledged message dropped from the store", || {
        let (_, notifs) = server.store.channel_snapshot(&mailbox).unwrap();
        notifs.is_empty()
    });

    // A live unicast wake-up follows the same path.
    server
        .store
        .append_to_unicast_channel(&mailbox, "app1", json!({"m": 2}), "msg-2", future())
        .unwrap();
    server.broker.unicast(&mailbox);
    let ServerMessage::Notifications { notifications } = client.recv() else {
        panic!("expected unicast delivery");
    };
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].msg_id.as_deref(), Some("msg-2"));
    client.ack_msg_ids(&["msg-2"]);
}

#[test]
fn user_keyed_mailbox_is_replayed_at_connect() {
    let server = start_server(quick_session_config());
    // Notified while offline, addressed through a (user, device) pair whose
    // user id is not the device id.
    let mailbox = ChannelId::unicast("u1", "DEV-W");
    server
        .store
        .append_to_unicast_channel(&mailbox, "app1", json!({"m": 9}), "msg-9", future())
        .unwrap();

    let (mut client, _) = TestClient::connect(server.addr, "DEV-W", &[], &[]);
    let ServerMessage::ConnBroadcast { .. } = client.recv() else {
        panic!("expected catch-up");
    };
    client.ack();

    let ServerMessage::Notifications { notifications } = client.recv() else {
        panic!("expected offline mail replay");
    };
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].msg_id.as_deref(), Some("msg-9"));
    client.ack_msg_ids(&["msg-9"]);

    wait_until("acknowledged message dropped from the store", || {
        let (_, notifs) = server.store.channel_snapshot(&mailbox).unwrap();
        notifs.is_empty()
    });
}

#[test]
fn silent_client_is_pinged_then_dropped() {
    let server = start_server(SessionConfig {
        ping_interval: Duration::from_millis(400),
        exchange_timeout: Duration::from_millis(200),
        queue_size: 10,
    });

    let (mut client, params) = TestClient::connect(server.addr, "DEV-PING", &[], &[]);
    assert_eq!(params.ping_interval_ms, 400);
    let ServerMessage::ConnBroadcast { .. } = client.recv() else {
        panic!("expected catch-up");
    };
    client.ack();
    wait_until("session registered", || server.broker.session_count() == 1);

    // Silence draws a PING; withholding the PONG kills the session.
    assert_eq!(client.recv(), ServerMessage::Ping);
    wait_until("registry vacated after ping timeout", || {
        server.broker.session_count() == 0
    });
    assert!(client.try_recv().is_err());
}

#[test]
fn responsive_client_survives_pings() {
    let server = start_server(SessionConfig {
        ping_interval: Duration::from_millis(300),
        exchange_timeout: Duration::from_millis(200),
        queue_size: 10,
    });

    let (mut client, _) = TestClient::connect(server.addr, "DEV-PONG", &[], &[]);
    let ServerMessage::ConnBroadcast { .. } = client.recv() else {
        panic!("expected catch-up");
    };
    client.ack();

    for _ in 0..2 {
        assert_eq!(client.recv(), ServerMessage::Ping);
        client.pong();
    }
    assert_eq!(server.broker.session_count(), 1);
}

#[test]
fn non_connect_first_frame_ends_the_session() {
    let server = start_server(quick_session_config());

    let stream = std::net::TcpStream::connect(server.addr).unwrap();
    let mut proto =
        courier::protocol::ProtoConn::new(stream, Duration::from_secs(2));
    proto
        .write_message(&courier::protocol::ClientMessage::Pong)
        .unwrap();

    // No CONNACK, no registration; the server hangs up.
    assert!(proto.read_message::<ServerMessage>().is_err());
    assert_eq!(server.broker.session_count(), 0);
}
