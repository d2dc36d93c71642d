use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

use relay::{MembershipRegistry, RelayContext};
use shared::{
    domain::UserId,
    protocol::{ClientEvent, ServerEvent},
};
use storage::ChatStore;

use crate::{auth::TokenVerifier, build_router, AppState};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TEST_SECRET: &[u8] = b"session-test-secret";

struct TestServer {
    addr: SocketAddr,
    state: Arc<AppState>,
}

async fn spawn_server() -> TestServer {
    let store = ChatStore::new("sqlite::memory:").await.expect("open store");
    let state = Arc::new(AppState {
        relay: RelayContext {
            store,
            registry: MembershipRegistry::new(),
        },
        verifier: TokenVerifier::new(TEST_SECRET),
    });
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    TestServer { addr, state }
}

#[derive(Serialize)]
struct TestClaims {
    sub: String,
    exp: i64,
}

fn mint_token(sub: &str, ttl_seconds: i64) -> String {
    let exp = (Utc::now() + chrono::Duration::seconds(ttl_seconds)).timestamp();
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &TestClaims {
            sub: sub.into(),
            exp,
        },
        &jsonwebtoken::EncodingKey::from_secret(TEST_SECRET),
    )
    .expect("token")
}

async fn connect(server: &TestServer, identity: &str) -> WsClient {
    let token = mint_token(identity, 60);
    let url = format!("ws://{}/ws?token={token}", server.addr);
    let (socket, _response) = connect_async(url).await.expect("connect");
    socket
}

async fn send_event(socket: &mut WsClient, event: &ClientEvent) {
    let text = serde_json::to_string(event).expect("encode event");
    socket
        .send(tungstenite::Message::Text(text))
        .await
        .expect("send frame");
}

async fn next_event(socket: &mut WsClient) -> ServerEvent {
    let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for event")
        .expect("socket closed")
        .expect("frame error");
    let tungstenite::Message::Text(text) = frame else {
        panic!("unexpected frame: {frame:?}");
    };
    serde_json::from_str(&text).expect("event json")
}

/// The session joins the group asynchronously after the handshake, so
/// tests poll the registry instead of sleeping a fixed interval.
async fn wait_until_grouped(server: &TestServer, identity: &UserId, size: usize) {
    for _ in 0..50 {
        if server.state.relay.registry.group_size(identity).await == size {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("group for {identity} never reached size {size}");
}

#[tokio::test]
async fn relays_message_to_receiver_and_acks_sender() {
    let server = spawn_server().await;
    let u1 = UserId::from("u1");
    let u2 = UserId::from("u2");

    let mut sender = connect(&server, "u1").await;
    let mut receiver = connect(&server, "u2").await;
    wait_until_grouped(&server, &u1, 1).await;
    wait_until_grouped(&server, &u2, 1).await;

    send_event(
        &mut sender,
        &ClientEvent::PrivateMsg {
            receiver: u2.clone(),
            msg: "hi there".into(),
        },
    )
    .await;

    match next_event(&mut sender).await {
        ServerEvent::MessageAccepted(ack) => {
            assert_eq!(ack.sender, u1);
            assert_eq!(ack.receiver, u2);
            assert_eq!(ack.message, "hi there");
            assert!(!ack.date.is_empty());
        }
        other => panic!("expected ack, got {other:?}"),
    }

    match next_event(&mut receiver).await {
        ServerEvent::MessageDelivered(delivered) => {
            assert_eq!(delivered.sender, u1);
            assert_eq!(delivered.receiver, u2);
            assert_eq!(delivered.message, "hi there");
        }
        other => panic!("expected delivery, got {other:?}"),
    }
}

#[tokio::test]
async fn acks_and_persists_when_receiver_is_offline() {
    let server = spawn_server().await;
    let u1 = UserId::from("u1");
    let u2 = UserId::from("u2");

    let mut sender = connect(&server, "u1").await;
    wait_until_grouped(&server, &u1, 1).await;

    send_event(
        &mut sender,
        &ClientEvent::PrivateMsg {
            receiver: u2.clone(),
            msg: "see you later".into(),
        },
    )
    .await;

    match next_event(&mut sender).await {
        ServerEvent::MessageAccepted(ack) => assert_eq!(ack.receiver, u2),
        other => panic!("expected ack, got {other:?}"),
    }

    // The ack races the store write, so poll until the row lands.
    for _ in 0..50 {
        let rows = server
            .state
            .relay
            .store
            .list_between(&u1, &u2)
            .await
            .expect("list");
        if let Some(row) = rows.first() {
            assert_eq!(row.body, "see you later");
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("message never reached the store");
}

#[tokio::test]
async fn every_receiver_device_gets_the_message() {
    let server = spawn_server().await;
    let u1 = UserId::from("u1");
    let u2 = UserId::from("u2");

    let mut sender = connect(&server, "u1").await;
    let mut phone = connect(&server, "u2").await;
    let mut laptop = connect(&server, "u2").await;
    wait_until_grouped(&server, &u1, 1).await;
    wait_until_grouped(&server, &u2, 2).await;

    send_event(
        &mut sender,
        &ClientEvent::PrivateMsg {
            receiver: u2.clone(),
            msg: "ping".into(),
        },
    )
    .await;

    for device in [&mut phone, &mut laptop] {
        match next_event(device).await {
            ServerEvent::MessageDelivered(delivered) => assert_eq!(delivered.message, "ping"),
            other => panic!("expected delivery, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn delete_pushes_refreshed_conversation_to_both_parties() {
    let server = spawn_server().await;
    let u1 = UserId::from("u1");
    let u2 = UserId::from("u2");

    let keep = server
        .state
        .relay
        .store
        .insert_chat(&u1, &u2, "keep me", Utc::now())
        .await
        .expect("seed");
    let doomed = server
        .state
        .relay
        .store
        .insert_chat(&u1, &u2, "delete me", Utc::now())
        .await
        .expect("seed");

    let mut first = connect(&server, "u1").await;
    let mut second = connect(&server, "u2").await;
    wait_until_grouped(&server, &u1, 1).await;
    wait_until_grouped(&server, &u2, 1).await;

    send_event(
        &mut first,
        &ClientEvent::DeleteMessage {
            sender: u1.clone(),
            receiver: u2.clone(),
            chat_id: doomed.chat_id,
        },
    )
    .await;

    for socket in [&mut first, &mut second] {
        match next_event(socket).await {
            ServerEvent::ConversationRefreshed(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].chat_id, keep.chat_id);
                assert_eq!(list[0].message, "keep me");
            }
            other => panic!("expected refreshed conversation, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn malformed_frames_do_not_kill_the_session() {
    let server = spawn_server().await;
    let u1 = UserId::from("u1");

    let mut sender = connect(&server, "u1").await;
    wait_until_grouped(&server, &u1, 1).await;

    sender
        .send(tungstenite::Message::Text("not json".into()))
        .await
        .expect("send garbage");

    send_event(
        &mut sender,
        &ClientEvent::PrivateMsg {
            receiver: UserId::from("u2"),
            msg: "still alive".into(),
        },
    )
    .await;

    match next_event(&mut sender).await {
        ServerEvent::MessageAccepted(ack) => assert_eq!(ack.message, "still alive"),
        other => panic!("expected ack, got {other:?}"),
    }
}

#[tokio::test]
async fn rejects_connection_without_token() {
    let server = spawn_server().await;

    let url = format!("ws://{}/ws", server.addr);
    let error = connect_async(url).await.expect_err("must refuse");

    match error {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected http rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn rejects_expired_token_before_any_group_binding() {
    let server = spawn_server().await;
    let u1 = UserId::from("u1");

    let token = mint_token("u1", -300);
    let url = format!("ws://{}/ws?token={token}", server.addr);
    let error = connect_async(url).await.expect_err("must refuse");

    match error {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected http rejection, got {other:?}"),
    }
    assert_eq!(server.state.relay.registry.group_size(&u1).await, 0);
}

#[tokio::test]
async fn disconnect_leaves_the_group() {
    let server = spawn_server().await;
    let u1 = UserId::from("u1");

    let socket = connect(&server, "u1").await;
    wait_until_grouped(&server, &u1, 1).await;

    drop(socket);

    for _ in 0..50 {
        if server.state.relay.registry.group_size(&u1).await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connection never left the group after disconnect");
}
