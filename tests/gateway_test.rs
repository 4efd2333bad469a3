//! End-to-end tests over a real listener: WebSocket fan-out, session
//! refusal, the REST chat flow with live pushes, and admin force-close.

#![allow(clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chat_gateway::api::build_app;
use chat_gateway::app_state::AppState;
use chat_gateway::domain::UserId;
use chat_gateway::identity::{Identity, IdentityResolver};
use chat_gateway::persistence::memory::InMemoryStore;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ALICE: i64 = 1;
const BOB: i64 = 2;
const ALICE_TOKEN: &str = "tok-a";
const BOB_TOKEN: &str = "tok-b";

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    store: Arc<InMemoryStore>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let expires = Utc::now() + chrono::Duration::hours(1);
        for (token, id, email) in [
            (ALICE_TOKEN, ALICE, "alice@example.com"),
            (BOB_TOKEN, BOB, "bob@example.com"),
        ] {
            let identity = Identity {
                user_id: UserId::new(id),
                email: email.to_string(),
            };
            store.insert_session(token, identity, expires).await;
        }

        let state = AppState::new(
            Arc::<InMemoryStore>::clone(&store),
            Arc::<InMemoryStore>::clone(&store),
            IdentityResolver::SessionToken(Arc::<InMemoryStore>::clone(&store)),
            Duration::from_secs(30),
            CancellationToken::new(),
        );
        let app = build_app(state.clone());

        let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
            panic!("failed to bind test listener");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("listener has no local address");
        };
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
        });

        Self {
            addr,
            state,
            store,
            shutdown: Some(tx),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn connect(&self, token: &str) -> Client {
        let url = format!("ws://{}/ws?token={token}", self.addr);
        let Ok((client, _)) = tokio_tungstenite::connect_async(url).await else {
            panic!("websocket connect failed");
        };
        client
    }

    async fn wait_for_connections(&self, user: i64, expected: usize) {
        for _ in 0..200 {
            if self.state.registry.connection_count(UserId::new(user)).await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("user {user} never reached {expected} connections");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn next_text(client: &mut Client) -> String {
    loop {
        let Ok(next) = tokio::time::timeout(Duration::from_secs(2), client.next()).await else {
            panic!("no frame within timeout");
        };
        match next {
            Some(Ok(Message::Text(text))) => return text.as_str().to_string(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

async fn send_text(client: &mut Client, text: &str) {
    let Ok(()) = client.send(Message::text(text)).await else {
        panic!("websocket send failed");
    };
}

async fn json_body(response: reqwest::Response) -> Value {
    let Ok(body) = response.json::<Value>().await else {
        panic!("response body is not JSON");
    };
    body
}

#[tokio::test]
async fn relayed_frame_reaches_every_connection_of_recipient() {
    let server = TestServer::start().await;
    let mut alice_phone = server.connect(ALICE_TOKEN).await;
    let mut alice_laptop = server.connect(ALICE_TOKEN).await;
    let mut bob = server.connect(BOB_TOKEN).await;
    server.wait_for_connections(ALICE, 2).await;
    server.wait_for_connections(BOB, 1).await;

    send_text(&mut bob, "1:hello").await;
    assert_eq!(next_text(&mut alice_phone).await, "hello");
    assert_eq!(next_text(&mut alice_laptop).await, "hello");

    // A frame without a recipient is dropped; the sender stays connected.
    send_text(&mut bob, "hello").await;
    send_text(&mut bob, "1:still here").await;
    assert_eq!(next_text(&mut alice_phone).await, "still here");
    assert_eq!(server.state.registry.connection_count(UserId::new(BOB)).await, 1);
}

#[tokio::test]
async fn upgrade_with_unknown_token_is_refused() {
    let server = TestServer::start().await;
    let url = format!("ws://{}/ws?token=nope", server.addr);
    match tokio_tungstenite::connect_async(url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        Err(other) => panic!("expected an HTTP refusal, got {other:?}"),
        Ok(_) => panic!("upgrade with an unknown token must fail"),
    }
    assert!(server.state.registry.is_empty().await);
}

#[tokio::test]
async fn upgrade_accepts_percent_encoded_token() {
    let server = TestServer::start().await;
    let identity = Identity {
        user_id: UserId::new(7),
        email: "carol@example.com".to_string(),
    };
    server
        .store
        .insert_session("c+/=", identity, Utc::now() + chrono::Duration::hours(1))
        .await;

    let _carol = server.connect("c%2B%2F%3D").await;
    server.wait_for_connections(7, 1).await;
}

#[tokio::test]
async fn rest_chat_flow_pushes_and_enforces_read_rules() {
    let server = TestServer::start().await;
    let http = reqwest::Client::new();
    let mut bob = server.connect(BOB_TOKEN).await;
    server.wait_for_connections(BOB, 1).await;

    let Ok(response) = http
        .post(server.url("/api/v1/chats"))
        .bearer_auth(ALICE_TOKEN)
        .json(&json!({ "other_user_id": BOB }))
        .send()
        .await
    else {
        panic!("start chat request failed");
    };
    assert_eq!(response.status().as_u16(), 200);
    let chat = json_body(response).await;
    let Some(chat_id) = chat["id"].as_i64() else {
        panic!("chat has no id: {chat}");
    };

    let Ok(response) = http
        .post(server.url(&format!("/api/v1/chats/{chat_id}/messages")))
        .bearer_auth(ALICE_TOKEN)
        .json(&json!({ "content": "is it still available?" }))
        .send()
        .await
    else {
        panic!("send message request failed");
    };
    assert_eq!(response.status().as_u16(), 201);
    let sent = json_body(response).await;
    assert_eq!(sent["can_edit"], json!(true));
    let Some(message_id) = sent["id"].as_i64() else {
        panic!("message has no id: {sent}");
    };

    let Ok(push) = serde_json::from_str::<Value>(&next_text(&mut bob).await) else {
        panic!("push is not JSON");
    };
    assert_eq!(push["type"], json!("new_message"));
    assert_eq!(push["message"]["id"], json!(message_id));
    assert_eq!(push["message"]["content"], json!("is it still available?"));

    let unread = |token: &'static str| {
        let request = http
            .get(server.url("/api/v1/messages/unread/count"))
            .bearer_auth(token);
        async move {
            let Ok(response) = request.send().await else {
                panic!("unread count request failed");
            };
            json_body(response).await["unread_count"].as_u64()
        }
    };
    assert_eq!(unread(BOB_TOKEN).await, Some(1));
    assert_eq!(unread(ALICE_TOKEN).await, Some(0));

    let Ok(response) = http
        .post(server.url(&format!("/api/v1/chats/{chat_id}/read")))
        .bearer_auth(BOB_TOKEN)
        .send()
        .await
    else {
        panic!("mark read request failed");
    };
    assert_eq!(json_body(response).await["updated"], json!(1));
    assert_eq!(unread(BOB_TOKEN).await, Some(0));

    let Ok(response) = http
        .patch(server.url(&format!("/api/v1/messages/{message_id}")))
        .bearer_auth(ALICE_TOKEN)
        .json(&json!({ "content": "edited" }))
        .send()
        .await
    else {
        panic!("edit request failed");
    };
    assert_eq!(response.status().as_u16(), 409);

    let Ok(response) = http
        .delete(server.url(&format!("/api/v1/messages/{message_id}")))
        .bearer_auth(BOB_TOKEN)
        .send()
        .await
    else {
        panic!("delete request failed");
    };
    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test]
async fn rest_requires_credentials() {
    let server = TestServer::start().await;
    let Ok(response) = reqwest::get(server.url("/api/v1/chats")).await else {
        panic!("request failed");
    };
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn admin_reports_presence_and_force_closes_user() {
    let server = TestServer::start().await;
    let http = reqwest::Client::new();
    let _alice = server.connect(ALICE_TOKEN).await;
    let mut bob = server.connect(BOB_TOKEN).await;
    server.wait_for_connections(ALICE, 1).await;
    server.wait_for_connections(BOB, 1).await;

    let Ok(response) = http
        .get(server.url("/api/v1/admin/connections"))
        .send()
        .await
    else {
        panic!("stats request failed");
    };
    let stats = json_body(response).await;
    assert_eq!(stats["total_connections"], json!(2));
    assert_eq!(stats["online_users"], json!([ALICE, BOB]));

    let Ok(response) = http
        .post(server.url(&format!("/api/v1/admin/users/{BOB}/disconnect")))
        .send()
        .await
    else {
        panic!("disconnect request failed");
    };
    assert_eq!(json_body(response).await["closed"], json!(1));

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match bob.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return true,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert_eq!(closed.ok(), Some(true));

    // The reader task starts the grace timer right after the close frame.
    let mut liveness = Value::Null;
    for _ in 0..200 {
        let Ok(response) = http
            .get(server.url(&format!("/api/v1/admin/users/{BOB}/connections")))
            .send()
            .await
        else {
            panic!("user connections request failed");
        };
        let presence = json_body(response).await;
        assert_eq!(presence["online"], json!(false));
        liveness = presence["liveness"].clone();
        if liveness == json!("GRACE_PERIOD") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(liveness, json!("GRACE_PERIOD"));
    assert_eq!(server.state.liveness.pending_checks(), 1);
}
