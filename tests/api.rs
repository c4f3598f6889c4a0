use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{ Request, StatusCode };
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{ json, Value };
use tempfile::{ tempdir, TempDir };
use tower::ServiceExt;

use local_chat_relay::config::settings::SettingsStore;
use local_chat_relay::history::{ FileHistoryStore, HistoryStore };
use local_chat_relay::llm::{ BackendOptions, LlmType, RetryPolicy, SimulatedOptions };
use local_chat_relay::models::settings::Settings;
use local_chat_relay::relay::Relay;
use local_chat_relay::server::api::{ build_router, AppState };

fn default_settings() -> Settings {
    Settings {
        backend: LlmType::Simulated,
        api_endpoint: "http://localhost:11434/v1".to_string(),
        model: "local".to_string(),
        temperature: 0.7,
        max_tokens: 500,
        top_p: 1.0,
    }
}

async fn make_app() -> (Router, TempDir) {
    let temp = tempdir().unwrap();
    let history: Arc<dyn HistoryStore> = Arc::new(
        FileHistoryStore::new(temp.path().join("chats")).await.unwrap()
    );
    let settings = Arc::new(SettingsStore::new(temp.path().join("settings.json"), default_settings()));
    let options = BackendOptions {
        api_key: None,
        retry: RetryPolicy::none(),
        simulated: SimulatedOptions {
            reply: Some("Hello, world".to_string()),
            delay: Duration::ZERO,
        },
    };
    let relay = Arc::new(Relay::new(Arc::clone(&settings), options, None));
    let app = build_router(AppState { history, settings, relay });
    (app, temp)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, value)
}

fn ndjson(bytes: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[tokio::test]
async fn health_reports_ok() {
    let (app, _temp) = make_app().await;
    let (status, body) = send_json(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn chat_crud_round_trip() {
    let (app, _temp) = make_app().await;

    let (status, saved) = send_json(
        &app,
        "POST",
        "/api/chats",
        Some(json!({
            "messages": [
                {"id": "m1", "role": "user", "content": "Explain borrowing"},
                {"id": "m2", "role": "assistant", "content": "Sure."}
            ]
        }))
    ).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(saved["success"], json!(true));
    let id = saved["id"].as_str().unwrap().to_string();

    let (status, list) = send_json(&app, "GET", "/api/chats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list[0]["id"], json!(id));
    assert_eq!(list[0]["title"], json!("Explain borrowing"));
    assert_eq!(list[0]["messageCount"], json!(2));

    let uri = format!("/api/chats/{}", id);
    let (status, chat) = send_json(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chat["messages"][1]["content"], json!("Sure."));

    let (status, _) = send_json(&app, "PATCH", &uri, Some(json!({"title": "Borrowing"}))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, chat) = send_json(&app, "GET", &uri, None).await;
    assert_eq!(chat["title"], json!("Borrowing"));
    assert_eq!(chat["messages"][0]["id"], json!("m1"));

    let (status, _) = send_json(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send_json(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_json(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn saving_with_an_existing_id_overwrites() {
    let (app, _temp) = make_app().await;
    let chat = json!({"id": "fixed-id", "title": "One", "messages": []});
    send_json(&app, "POST", "/api/chats", Some(chat)).await;
    let chat = json!({"id": "fixed-id", "title": "Two", "messages": [{"role": "user", "content": "x"}]});
    let (_, saved) = send_json(&app, "POST", "/api/chats", Some(chat)).await;
    assert_eq!(saved["id"], json!("fixed-id"));

    let (_, list) = send_json(&app, "GET", "/api/chats", None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["title"], json!("Two"));
}

#[tokio::test]
async fn invalid_ids_and_missing_chats_are_client_errors() {
    let (app, _temp) = make_app().await;

    let (status, _) = send_json(&app, "GET", "/api/chats/bad%20id", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_json(&app, "PATCH", "/api/chats/missing", Some(json!({"title": "x"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send_json(&app, "PATCH", "/api/chats/missing", Some(json!({"title": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn settings_default_then_update() {
    let (app, temp) = make_app().await;

    let (status, settings) = send_json(&app, "GET", "/api/settings", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(settings["apiEndpoint"], json!("http://localhost:11434/v1"));
    assert_eq!(settings["maxTokens"], json!(500));
    assert!(temp.path().join("settings.json").exists());

    let mut updated = settings.clone();
    updated["model"] = json!("llama3");
    updated["topP"] = json!(0.5);
    let (status, _) = send_json(&app, "POST", "/api/settings", Some(updated)).await;
    assert_eq!(status, StatusCode::OK);

    let (_, settings) = send_json(&app, "GET", "/api/settings", None).await;
    assert_eq!(settings["model"], json!("llama3"));
    assert_eq!(settings["topP"], json!(0.5));

    let mut invalid = settings.clone();
    invalid["maxTokens"] = json!(0);
    let (status, body) = send_json(&app, "POST", "/api/settings", Some(invalid)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn chat_endpoint_streams_ndjson_tokens() {
    let (app, _temp) = make_app().await;

    let (status, bytes) = send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({"messages": [{"role": "user", "content": "hi"}]}))
    ).await;
    assert_eq!(status, StatusCode::OK);

    let frames = ndjson(&bytes);
    assert_eq!(frames.last(), Some(&json!({"done": true})));
    let text: String = frames
        .iter()
        .filter_map(|f| f["token"].as_str())
        .collect();
    assert_eq!(text, "Hello, world");
    assert!(frames.iter().all(|f| f.get("error").is_none()));
}

#[tokio::test]
async fn chat_endpoint_accepts_legacy_requests() {
    let (app, _temp) = make_app().await;

    let (status, bytes) = send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({"message": "hi", "history": [], "temperature": 0.3, "max_tokens": 32}))
    ).await;
    assert_eq!(status, StatusCode::OK);
    let frames = ndjson(&bytes);
    assert_eq!(frames.last(), Some(&json!({"done": true})));
}

#[tokio::test]
async fn chat_endpoint_rejects_bad_requests() {
    let (app, _temp) = make_app().await;

    let (status, _) = send(&app, "POST", "/api/chat", Some(json!({"messages": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", "/api/chat", Some(json!({"nonsense": true}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({"messages": [{"role": "user", "content": "hi"}], "temperature": 7.0}))
    ).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn models_come_from_the_configured_backend() {
    let (app, _temp) = make_app().await;
    let (status, models) = send_json(&app, "GET", "/api/models", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(models, json!(["simulated"]));
}

#[tokio::test]
async fn export_then_import_into_a_fresh_store() {
    let (app, _temp) = make_app().await;
    send_json(
        &app,
        "POST",
        "/api/chats",
        Some(json!({"id": "exported", "messages": [{"role": "user", "content": "keep me"}]}))
    ).await;

    let (status, export) = send_json(&app, "GET", "/api/export", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(export["chats"].as_array().unwrap().len(), 1);
    assert_eq!(export["settings"]["model"], json!("local"));

    let (fresh, _fresh_temp) = make_app().await;
    let (status, result) = send_json(&fresh, "POST", "/api/import", Some(export)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["imported"], json!(1));

    let (_, chat) = send_json(&fresh, "GET", "/api/chats/exported", None).await;
    assert_eq!(chat["messages"][0]["content"], json!("keep me"));
}

#[tokio::test]
async fn import_migrates_legacy_chat_maps() {
    let (app, _temp) = make_app().await;

    let legacy = json!({
        "chats": {
            "old-1": {"name": "Legacy", "messages": [{"role": "user", "content": "hello"}]},
            "bad id!": {"messages": []},
            "old-2": "not an object"
        }
    });
    let (status, result) = send_json(&app, "POST", "/api/import", Some(legacy)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["imported"], json!(1));
    assert_eq!(result["skipped"], json!(2));

    let (_, chat) = send_json(&app, "GET", "/api/chats/old-1", None).await;
    assert_eq!(chat["title"], json!("Legacy"));
    assert!(chat["messages"][0]["id"].as_str().is_some());
}
