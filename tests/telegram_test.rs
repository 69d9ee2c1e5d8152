// Telegram client against a local mock of the Bot API.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::Uri;
use axum::Router;
use cfbot::menu;
use cfbot::protocol::OutgoingMessage;
use cfbot::telegram::{ChatTransport, TelegramClient, TransportError, MAX_MESSAGE_CHARS};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

const TOKEN: &str = "123:SECRET";

type Calls = Arc<Mutex<Vec<(String, Value)>>>;

async fn mock_bot_api(State(calls): State<Calls>, uri: Uri, body: Bytes) -> String {
    let path = uri.path().to_string();
    if path == format!("/file/bot{}/documents/worker.js", TOKEN) {
        return "export default {}".to_string();
    }

    let method = path.rsplit('/').next().unwrap_or_default().to_string();
    let params: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    calls.lock().unwrap().push((method.clone(), params.clone()));

    let response = match method.as_str() {
        "getMe" => json!({ "ok": true, "result": { "id": 99, "is_bot": true, "first_name": "CfBot" } }),
        "getUpdates" => json!({ "ok": true, "result": [
            { "update_id": 5, "message": { "message_id": 1, "chat": { "id": 7 }, "text": "hi" } }
        ]}),
        "getFile" if params["file_id"] == "big" => json!({ "ok": true, "result": {
            "file_id": "big", "file_path": "documents/big.js", "file_size": 50_000_000u64
        }}),
        "getFile" => json!({ "ok": true, "result": {
            "file_id": params["file_id"], "file_path": "documents/worker.js", "file_size": 17
        }}),
        "sendMessage" | "answerCallbackQuery" => json!({ "ok": true, "result": true }),
        _ => json!({ "ok": false, "error_code": 404, "description": "Not Found" }),
    };
    response.to_string()
}

async fn start_mock() -> (TelegramClient, Calls) {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().fallback(mock_bot_api).with_state(calls.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = TelegramClient::with_api_base(TOKEN, format!("http://{}", addr)).unwrap();
    (client, calls)
}

fn calls_named(calls: &Calls, method: &str) -> Vec<Value> {
    calls
        .lock()
        .unwrap()
        .iter()
        .filter(|(name, _)| name == method)
        .map(|(_, params)| params.clone())
        .collect()
}

#[tokio::test]
async fn test_get_me_and_updates() {
    let (client, calls) = start_mock().await;

    let me = client.get_me().await.unwrap();
    assert_eq!(me.id, 99);

    let updates = client.get_updates(Some(5), 0).await.unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].message.as_ref().unwrap().chat.id, 7);

    let params = calls_named(&calls, "getUpdates").pop().unwrap();
    assert_eq!(params["offset"], 5);
    assert_eq!(params["timeout"], 0);
}

#[tokio::test]
async fn test_long_message_is_split_with_keyboard_last() {
    let (client, calls) = start_mock().await;
    let line = "x".repeat(100);
    let text = vec![line; 60].join("\n");
    assert!(text.chars().count() > MAX_MESSAGE_CHARS);

    client
        .send_message(OutgoingMessage::plain(7, text).with_keyboard(menu::main_menu()))
        .await
        .unwrap();

    let sent = calls_named(&calls, "sendMessage");
    assert_eq!(sent.len(), 2);
    assert!(sent[0].get("reply_markup").is_none());
    assert!(sent[1]["reply_markup"]["inline_keyboard"].is_array());
    assert_eq!(sent[1]["chat_id"], 7);
}

#[tokio::test]
async fn test_markdown_parse_mode_dropped_only_when_split() {
    let (client, calls) = start_mock().await;

    client
        .send_message(OutgoingMessage::markdown(7, "*short*"))
        .await
        .unwrap();
    let text = format!("*{}*\n{}", "b".repeat(3000), "c".repeat(3000));
    client
        .send_message(OutgoingMessage::markdown(7, text))
        .await
        .unwrap();

    let sent = calls_named(&calls, "sendMessage");
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0]["parse_mode"], "Markdown");
    assert!(sent[1].get("parse_mode").is_none());
    assert!(sent[2].get("parse_mode").is_none());
}

#[tokio::test]
async fn test_answer_callback_omits_missing_text() {
    let (client, calls) = start_mock().await;

    client.answer_callback("cb-1", None).await.unwrap();
    client.answer_callback("cb-2", Some("Silakan login dulu.")).await.unwrap();

    let answers = calls_named(&calls, "answerCallbackQuery");
    assert!(answers[0].get("text").is_none());
    assert_eq!(answers[1]["text"], "Silakan login dulu.");
}

#[tokio::test]
async fn test_download_document() {
    let (client, _calls) = start_mock().await;

    let bytes = client.download_document("file-1").await.unwrap();
    assert_eq!(bytes, b"export default {}");

    let err = client.download_document("big").await.unwrap_err();
    assert!(matches!(err, TransportError::Api { .. }));
}

#[tokio::test]
async fn test_api_errors_do_not_leak_token() {
    let (client, _calls) = start_mock().await;
    let err = client.set_webhook("https://example.com").await.unwrap_err();
    assert!(matches!(err, TransportError::Api { .. }));
    assert!(err.to_string().contains("Not Found"));

    let unreachable = TelegramClient::with_api_base(TOKEN, "http://127.0.0.1:1").unwrap();
    let err = unreachable.get_me().await.unwrap_err();
    assert!(matches!(err, TransportError::Http { .. }));
    assert!(!err.to_string().contains("SECRET"));
}
