use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use shared::domain::{ConversationId, UserId};
use tokio::{
    net::TcpListener,
    time::{timeout, Duration as TokioDuration},
};

use super::*;

/// Answers `authenticate` and `get_online_users`, and hangs up on the first
/// connection after its first reply to exercise reconnects.
async fn fake_relay(ws: WebSocketUpgrade, State(sessions): State<Arc<AtomicU64>>) -> impl IntoResponse {
    let session = sessions.fetch_add(1, Ordering::SeqCst) + 1;
    ws.on_upgrade(move |socket| serve_session(socket, session))
}

async fn serve_session(mut socket: WebSocket, session: u64) {
    let mut user = None;
    while let Some(Ok(WsMessage::Text(text))) = socket.recv().await {
        let command: ClientCommand = serde_json::from_str(&text).expect("command");
        let reply = match command {
            ClientCommand::Authenticate { user_id, .. } => {
                user = Some(user_id);
                RelayEvent::Authenticated {
                    user_id,
                    connection_id: session,
                }
            }
            ClientCommand::GetOnlineUsers => RelayEvent::OnlineUsers {
                user_ids: user.into_iter().collect(),
            },
            ClientCommand::JoinConversation { conversation_id } => RelayEvent::UserTyping {
                conversation_id,
                user_id: UserId(0),
                is_typing: false,
            },
            _ => continue,
        };
        let text = serde_json::to_string(&reply).expect("encode");
        if socket.send(WsMessage::Text(text)).await.is_err() {
            return;
        }
        if session == 1 {
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
    }
}

async fn spawn_relay() -> String {
    let app = Router::new()
        .route("/ws", get(fake_relay))
        .with_state(Arc::new(AtomicU64::new(0)));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn identity() -> Identity {
    Identity {
        user_id: UserId(7),
        display_name: "gina".into(),
        role: "member".into(),
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    timeout(TokioDuration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport closed")
}

#[test]
fn backoff_doubles_up_to_cap_and_resets() {
    let mut backoff = Backoff::default();
    let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
    assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_secs(1));
}

#[test]
fn relay_url_follows_scheme() {
    assert_eq!(
        relay_ws_url("http://localhost:8443").expect("url").as_str(),
        "ws://localhost:8443/ws"
    );
    assert_eq!(
        relay_ws_url("https://chat.example.com/portal/").expect("url").as_str(),
        "wss://chat.example.com/ws"
    );
    assert!(relay_ws_url("ftp://example.com").is_err());
    assert!(relay_ws_url("not a url").is_err());
}

#[tokio::test]
async fn authenticates_first_and_reconnects_after_drop() {
    let server_url = spawn_relay().await;
    let (handle, mut events) = TransportHandle::spawn(&server_url, identity()).expect("spawn");

    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Event(RelayEvent::Authenticated {
            user_id: UserId(7),
            connection_id: 1,
        })
    );
    assert_eq!(next_event(&mut events).await, TransportEvent::Disconnected);

    // Queued while the socket is down; delivered after the next authenticate.
    handle.send(ClientCommand::GetOnlineUsers);

    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Event(RelayEvent::Authenticated {
            user_id: UserId(7),
            connection_id: 2,
        })
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Event(RelayEvent::OnlineUsers {
            user_ids: vec![UserId(7)],
        })
    );

    handle.send(ClientCommand::JoinConversation {
        conversation_id: ConversationId(3),
    });
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Event(RelayEvent::UserTyping {
            conversation_id: ConversationId(3),
            user_id: UserId(0),
            is_typing: false,
        })
    );
}

#[tokio::test]
async fn dropping_handle_stops_the_task() {
    let server_url = spawn_relay().await;
    let (handle, mut events) = TransportHandle::spawn(&server_url, identity()).expect("spawn");
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
    drop(handle);
    let closed = timeout(TokioDuration::from_secs(5), async {
        while events.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());
}
