// Webhook server accepting Telegram updates over HTTP.

use cfbot::webhook;
use serde_json::{json, Value};
use tokio::sync::mpsc;

const TOKEN: &str = "123:ABC";

async fn start_server(updates: mpsc::Sender<cfbot::protocol::Update>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = webhook::router(TOKEN, updates);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_webhook_forwards_updates() {
    let (tx, mut rx) = mpsc::channel(8);
    let base = start_server(tx).await;
    let client = reqwest::Client::new();

    let response = client
        .post(webhook::webhook_url(&base, TOKEN))
        .json(&json!({
            "update_id": 41,
            "message": {
                "message_id": 1,
                "from": { "id": 7, "is_bot": false, "first_name": "Ana" },
                "chat": { "id": 7, "type": "private" },
                "text": "/start"
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let update = rx.recv().await.expect("update forwarded");
    assert_eq!(update.update_id, 41);
    assert_eq!(
        update.message.and_then(|m| m.text).as_deref(),
        Some("/start")
    );
}

#[tokio::test]
async fn test_webhook_rejects_bad_requests() {
    let (tx, _rx) = mpsc::channel(8);
    let base = start_server(tx).await;
    let client = reqwest::Client::new();

    let malformed = client
        .post(webhook::webhook_url(&base, TOKEN))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);

    let wrong_token = client
        .post(webhook::webhook_url(&base, "999:XYZ"))
        .json(&json!({ "update_id": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_token.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webhook_unavailable_when_dispatcher_gone() {
    let (tx, rx) = mpsc::channel(8);
    drop(rx);
    let base = start_server(tx).await;

    let response = reqwest::Client::new()
        .post(webhook::webhook_url(&base, TOKEN))
        .json(&json!({ "update_id": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_health_endpoint() {
    let (tx, _rx) = mpsc::channel(8);
    let base = start_server(tx).await;

    let response = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}
