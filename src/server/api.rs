use crate::cli::Args;
use crate::config::settings::SettingsStore;
use crate::history::migrate::{ self, Fallback };
use crate::history::{ HistoryStore, StoreError };
use crate::llm::chat::BoxError;
use crate::models::chat::{ derive_title, new_id, Conversation, Message };
use crate::models::settings::Settings;
use crate::models::websocket::{ parse_stream_request, StreamFrame };
use crate::relay::Relay;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    body::{ Body, Bytes },
    extract::{ Path, State },
    http::{ header, StatusCode },
    response::{ IntoResponse, Response },
    routing::{ get, post },
    Json,
    Router,
};
use chrono::{ DateTime, Utc };
use futures::StreamExt;
use serde::{ Deserialize, Serialize };
use serde_json::{ json, Value };
use tower_http::cors::{ Any, CorsLayer };
use log::{ info, warn, error };

#[derive(Clone)]
pub struct AppState {
    pub history: Arc<dyn HistoryStore>,
    pub settings: Arc<SettingsStore>,
    pub relay: Arc<Relay>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidId(_) | StoreError::InvalidSettings(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Storage failure: {}", err);
        }
        ApiError::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "success": false, "error": self.message }))).into_response()
    }
}

#[derive(Deserialize)]
pub struct SaveChatRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub title: String,
}

#[derive(Serialize)]
struct ExportDocument {
    chats: Vec<Conversation>,
    settings: Settings,
}

#[derive(Deserialize)]
pub struct ImportRequest {
    #[serde(default)]
    pub chats: Option<Value>,
    #[serde(default)]
    pub settings: Option<Settings>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/chats", get(list_chats).post(save_chat))
        .route("/api/chats/{id}", get(get_chat).delete(delete_chat).patch(rename_chat))
        .route("/api/settings", get(get_settings).post(save_settings))
        .route("/api/models", get(list_models))
        .route("/api/export", get(export_all))
        .route("/api/import", post(import_all))
        .route("/api/chat", post(chat_stream))
        .layer(cors)
        .with_state(state)
}

pub async fn start_http_server(
    addr: &str,
    state: AppState,
    args: &Args,
) -> Result<(), BoxError> {
    let addr = addr.parse::<SocketAddr>()?;
    let app = build_router(state);

    if args.enable_tls {
        let (cert_path, key_path) = match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => {
                return Err("TLS enabled without --tls-cert-path and --tls-key-path".into());
            }
        };
        super::tls::install_crypto_provider();
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            cert_path,
            key_path
        ).await?;

        info!("Starting HTTPS API server on: https://{}", addr);
        tokio::spawn(async move {
            let result = axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await;

            if let Err(e) = result {
                error!("HTTPS server error: {}", e);
            }
        });
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e|
            format!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e)
        )?;
        info!("Starting HTTP API server on: http://{}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                error!("HTTP server error: {}", e);
            }
        });
    }

    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_chats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.history.list().await?))
}

async fn get_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(state.history.get(&id).await?))
}

async fn save_chat(
    State(state): State<AppState>,
    Json(req): Json<SaveChatRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = req.id.filter(|id| !id.is_empty()).unwrap_or_else(new_id);
    // a client-sent title and timestamp are stored as given
    let title = req.title.unwrap_or_else(|| derive_title(&req.messages));
    let conversation = Conversation {
        id: id.clone(),
        title,
        messages: req.messages,
        timestamp: req.timestamp.unwrap_or_else(Utc::now),
    };
    state.history.save(&conversation).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

async fn delete_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.history.delete(&id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn rename_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<Value>, ApiError> {
    let title = req.title.trim();
    if title.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "title must not be empty"));
    }
    state.history.rename(&id, title).await?;
    Ok(Json(json!({ "success": true })))
}

async fn get_settings(State(state): State<AppState>) -> Result<Json<Settings>, ApiError> {
    Ok(Json(state.settings.get().await?))
}

async fn save_settings(
    State(state): State<AppState>,
    Json(settings): Json<Settings>,
) -> Result<Json<Value>, ApiError> {
    state.settings.save(&settings).await?;
    Ok(Json(json!({ "success": true })))
}

async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    state.relay.list_models().await.map(Json).map_err(|e| {
        warn!("Listing models failed: {}", e);
        ApiError::new(StatusCode::BAD_GATEWAY, e.to_string())
    })
}

async fn export_all(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let summaries = state.history.list().await?;
    let mut chats = Vec::with_capacity(summaries.len());
    for summary in summaries {
        match state.history.get(&summary.id).await {
            Ok(chat) => chats.push(chat),
            Err(e) => warn!("Export skipped {}: {}", summary.id, e),
        }
    }
    let settings = state.settings.get().await?;
    Ok(Json(ExportDocument { chats, settings }))
}

/// Accepts chats as an array or as the older `{id: chat}` map.
fn import_entries(chats: Value) -> Result<Vec<(Option<String>, Value)>, ApiError> {
    match chats {
        Value::Array(items) => Ok(items.into_iter().map(|v| (None, v)).collect()),
        Value::Object(map) => Ok(map.into_iter().map(|(k, v)| (Some(k), v)).collect()),
        Value::Null => Ok(Vec::new()),
        _ => Err(ApiError::new(StatusCode::BAD_REQUEST, "chats must be an array or an object")),
    }
}

async fn import_all(
    State(state): State<AppState>,
    Json(req): Json<ImportRequest>,
) -> Result<Json<Value>, ApiError> {
    if let Some(settings) = &req.settings {
        settings.validate().map_err(StoreError::from)?;
    }
    let entries = match req.chats {
        Some(chats) => import_entries(chats)?,
        None => Vec::new(),
    };

    let mut imported = 0usize;
    let mut skipped = 0usize;
    let now = Utc::now();
    for (key, raw) in entries {
        let fallback_id = key.unwrap_or_else(new_id);
        let decoded = migrate::decode(raw, &Fallback { id: &fallback_id, timestamp: now });
        match decoded {
            Ok(conversation) => {
                match state.history.save(&conversation).await {
                    Ok(()) => {
                        imported += 1;
                    }
                    Err(StoreError::InvalidId(id)) => {
                        warn!("Import skipped conversation with invalid id '{}'", id);
                        skipped += 1;
                    }
                    Err(e) => {
                        return Err(e.into());
                    }
                }
            }
            Err(e) => {
                warn!("Import skipped malformed conversation: {}", e);
                skipped += 1;
            }
        }
    }

    if let Some(settings) = &req.settings {
        state.settings.save(settings).await?;
    }
    info!("Import finished: {} chats imported, {} skipped", imported, skipped);
    Ok(Json(json!({ "success": true, "imported": imported, "skipped": skipped })))
}

fn ndjson_line(frame: &StreamFrame) -> Bytes {
    let mut line = serde_json::to_vec(frame).unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}

async fn chat_stream(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match parse_stream_request(&body) {
        Ok(r) => r,
        Err(e) => {
            return ApiError::new(StatusCode::BAD_REQUEST, format!("invalid request: {}", e)).into_response();
        }
    };
    info!("HTTP stream request with {} messages", request.messages.len());

    let mut stream = match state.relay.open_stream(request).await {
        Ok(s) => s,
        Err(e) => {
            let status = if e.is_client_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::BAD_GATEWAY
            };
            error!("Error initiating HTTP stream: {}", e);
            return ApiError::new(status, e.to_string()).into_response();
        }
    };

    let body = Body::from_stream(async_stream::stream! {
        let mut token_count = 0usize;
        let mut failed = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(token) => {
                    token_count += 1;
                    yield Ok::<Bytes, Infallible>(ndjson_line(&StreamFrame::Token { token }));
                }
                Err(e) => {
                    error!("Error in HTTP chat stream: {}", e);
                    yield Ok(ndjson_line(&StreamFrame::Error { error: e.to_string() }));
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            info!("HTTP stream completed successfully, sent {} tokens", token_count);
            yield Ok(ndjson_line(&StreamFrame::Done { done: true }));
        }
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    ).into_response()
}
