use super::*;
use axum::{body, body::Body, http::Request};
use server_api::ApiContext;
use shared::domain::{ConversationKind, ParticipantRole};
use storage::Storage;
use tokio::sync::mpsc;
use tower::ServiceExt;

struct Fixture {
    app: Router,
    state: Arc<AppState>,
    alice: UserId,
    bob: UserId,
    conversation: ConversationId,
}

async fn fixture_with_public_url(public_url: Option<&str>) -> Fixture {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice", "hr").await.expect("alice");
    let bob = storage.create_user("bob", "employee").await.expect("bob");
    let conversation = storage
        .create_conversation(
            ConversationKind::Direct,
            None,
            &[(alice, ParticipantRole::Owner), (bob, ParticipantRole::Member)],
        )
        .await
        .expect("conversation");

    let state = Arc::new(AppState::new(
        ApiContext { storage },
        public_url.map(str::to_string),
    ));
    Fixture {
        app: build_router(state.clone()),
        state,
        alice,
        bob,
        conversation,
    }
}

async fn fixture() -> Fixture {
    fixture_with_public_url(None).await
}

async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

fn post_text(fx: &Fixture, user_id: UserId, content: &str) -> Request<Body> {
    Request::post("/messages")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "user_id": user_id.0,
                "conversation_id": fx.conversation.0,
                "content": content,
            })
            .to_string(),
        ))
        .expect("request")
}

async fn join_listener(
    fx: &Fixture,
    user_id: UserId,
    name: &str,
) -> (u64, mpsc::UnboundedReceiver<RelayEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let connection_id = fx.state.rooms.register(tx).await;
    fx.state
        .rooms
        .authenticate(
            connection_id,
            shared::domain::Identity {
                user_id,
                display_name: name.to_string(),
                role: "employee".to_string(),
            },
        )
        .await;
    fx.state.rooms.join(connection_id, fx.conversation).await;
    while rx.try_recv().is_ok() {}
    (connection_id, rx)
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let fx = fixture().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = fx.app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn posted_message_is_broadcast_to_room_except_origin() {
    let fx = fixture().await;
    let (alice_conn, mut alice_rx) = join_listener(&fx, fx.alice, "alice").await;
    let (_bob_conn, mut bob_rx) = join_listener(&fx, fx.bob, "bob").await;

    let request = Request::post("/messages")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "user_id": fx.alice.0,
                "conversation_id": fx.conversation.0,
                "content": "hello bob",
                "origin_connection": alice_conn,
            })
            .to_string(),
        ))
        .expect("request");
    let response = fx.app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let stored: MessagePayload = json_body(response).await;
    assert_eq!(stored.body.content(), "hello bob");
    assert_eq!(stored.sender_name.as_deref(), Some("alice"));

    match bob_rx.try_recv().expect("bob gets the message") {
        RelayEvent::NewMessage { message } => assert_eq!(message, stored),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn conversation_list_reports_preview_and_unread() {
    let fx = fixture().await;
    let response = fx
        .app
        .clone()
        .oneshot(post_text(&fx, fx.alice, "first line\nsecond line"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::get(format!("/conversations?user_id={}", fx.bob.0))
        .body(Body::empty())
        .expect("request");
    let response = fx.app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let conversations: Vec<ConversationSummary> = json_body(response).await;
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].unread_count, 1);
    assert_eq!(
        conversations[0].last_message_preview.as_deref(),
        Some("first line")
    );
    assert_eq!(conversations[0].participants.len(), 2);
}

#[tokio::test]
async fn outsider_gets_forbidden_history() {
    let fx = fixture().await;
    let mallory = fx
        .state
        .api
        .storage
        .create_user("mallory", "employee")
        .await
        .expect("user");
    let request = Request::get(format!(
        "/conversations/{}/messages?user_id={}",
        fx.conversation.0, mallory.0
    ))
    .body(Body::empty())
    .expect("request");
    let response = fx.app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let err: ApiError = json_body(response).await;
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn mark_read_broadcasts_receipt_only_when_something_changed() {
    let fx = fixture().await;
    let (_alice_conn, mut alice_rx) = join_listener(&fx, fx.alice, "alice").await;
    let response = fx
        .app
        .clone()
        .oneshot(post_text(&fx, fx.alice, "ping"))
        .await
        .expect("response");
    let stored: MessagePayload = json_body(response).await;
    while alice_rx.try_recv().is_ok() {}

    let mark_read = || {
        Request::patch(format!("/conversations/{}/read", fx.conversation.0))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "user_id": fx.bob.0 }).to_string(),
            ))
            .expect("request")
    };

    let response = fx.app.clone().oneshot(mark_read()).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let receipt: MarkReadResponse = json_body(response).await;
    assert_eq!(receipt.message_ids, vec![stored.message_id]);
    assert_eq!(
        alice_rx.try_recv().expect("receipt"),
        RelayEvent::ReadReceipt {
            conversation_id: fx.conversation,
            message_ids: vec![stored.message_id],
            reader_id: fx.bob,
        }
    );

    let response = fx.app.oneshot(mark_read()).await.expect("response");
    let receipt: MarkReadResponse = json_body(response).await;
    assert!(receipt.message_ids.is_empty());
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn delete_for_everyone_by_non_sender_is_forbidden() {
    let fx = fixture().await;
    let response = fx
        .app
        .clone()
        .oneshot(post_text(&fx, fx.alice, "mine"))
        .await
        .expect("response");
    let stored: MessagePayload = json_body(response).await;

    let request = Request::delete(format!("/messages/{}", stored.message_id.0))
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "user_id": fx.bob.0, "scope": "all" }).to_string(),
        ))
        .expect("request");
    let response = fx.app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn delete_for_me_notifies_own_connections_and_hides_history() {
    let fx = fixture().await;
    let (_bob_conn, mut bob_rx) = join_listener(&fx, fx.bob, "bob").await;
    let (_alice_conn, mut alice_rx) = join_listener(&fx, fx.alice, "alice").await;
    let response = fx
        .app
        .clone()
        .oneshot(post_text(&fx, fx.alice, "to hide"))
        .await
        .expect("response");
    let stored: MessagePayload = json_body(response).await;
    while bob_rx.try_recv().is_ok() {}
    while alice_rx.try_recv().is_ok() {}

    let request = Request::delete(format!("/messages/{}", stored.message_id.0))
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "user_id": fx.bob.0, "scope": "me" }).to_string(),
        ))
        .expect("request");
    let response = fx.app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        bob_rx.try_recv().expect("deleted for me"),
        RelayEvent::MessageDeletedForMe {
            message_id: stored.message_id,
            conversation_id: fx.conversation,
        }
    );
    assert!(alice_rx.try_recv().is_err());

    let request = Request::get(format!(
        "/conversations/{}/messages?user_id={}",
        fx.conversation.0, fx.bob.0
    ))
    .body(Body::empty())
    .expect("request");
    let response = fx.app.oneshot(request).await.expect("response");
    let history: Vec<MessagePayload> = json_body(response).await;
    assert!(history.is_empty());
}

#[tokio::test]
async fn file_upload_round_trips_through_download() {
    let fx = fixture_with_public_url(Some("https://chat.example/")).await;
    let upload = Request::post(format!(
        "/files/upload?user_id={}&filename=report.pdf",
        fx.alice.0
    ))
    .header("content-type", "application/pdf")
    .body(Body::from("pdf-bytes"))
    .expect("request");
    let response = fx.app.clone().oneshot(upload).await.expect("upload response");
    assert_eq!(response.status(), StatusCode::OK);
    let uploaded: UploadResponse = json_body(response).await;
    assert_eq!(uploaded.name, "report.pdf");
    assert_eq!(uploaded.size, 9);
    assert_eq!(uploaded.mime_type, "application/pdf");
    assert_eq!(
        uploaded.url,
        format!("https://chat.example/files/{}", uploaded.file_id.0)
    );

    let download = Request::get(format!("/files/{}", uploaded.file_id.0))
        .body(Body::empty())
        .expect("request");
    let response = fx.app.oneshot(download).await.expect("download response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).expect("type"),
        "application/pdf"
    );
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(bytes.as_ref(), b"pdf-bytes");
}

#[tokio::test]
async fn upload_with_path_separator_is_rejected() {
    let fx = fixture().await;
    let upload = Request::post(format!(
        "/files/upload?user_id={}&filename=..%2Fetc%2Fpasswd",
        fx.alice.0
    ))
    .body(Body::from("x"))
    .expect("request");
    let response = fx.app.oneshot(upload).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_file_is_not_found() {
    let fx = fixture().await;
    let request = Request::get("/files/404")
        .body(Body::empty())
        .expect("request");
    let response = fx.app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[test]
fn error_codes_map_to_http_statuses() {
    assert_eq!(status_for(ErrorCode::Unauthorized), StatusCode::UNAUTHORIZED);
    assert_eq!(status_for(ErrorCode::PayloadTooLarge), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(status_for(ErrorCode::Validation), StatusCode::BAD_REQUEST);
}
