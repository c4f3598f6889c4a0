use async_trait::async_trait;
use futures::{ SinkExt, StreamExt };
use log::{ debug, info, warn };
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::llm::chat::{ create_streaming_response, BoxError, TokenStream };
use crate::models::chat::Message;
use crate::models::settings::Settings;
use crate::models::websocket::ServerMessage;
use crate::relay::ChatRelay;

/// Talks to a running relay over its WebSocket endpoint, one connection per reply.
pub struct WsRelayClient {
    url: String,
    api_key: Option<String>,
}

impl WsRelayClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), api_key: None }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait]
impl ChatRelay for WsRelayClient {
    async fn stream(
        &self,
        messages: &[Message],
        settings: Option<&Settings>
    ) -> Result<TokenStream, BoxError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(key) = &self.api_key {
            request.headers_mut().insert("X-API-Key", HeaderValue::from_str(key)?);
        }

        let (socket, _) = connect_async(request).await?;
        info!("Connected to relay at {}", self.url);
        let (mut write, mut read) = socket.split();

        let frame = json!({ "type": "stream", "messages": messages, "settings": settings });
        write.send(WsMessage::Text(frame.to_string())).await?;

        Ok(
            create_streaming_response(move |tx| async move {
                loop {
                    let incoming = tokio::select! {
                        _ = tx.closed() => {
                            debug!("Reply dropped, cancelling relay stream");
                            let cancel = json!({ "type": "cancel" }).to_string();
                            if write.send(WsMessage::Text(cancel)).await.is_ok() {
                                let _ = write.close().await;
                            }
                            return;
                        }
                        incoming = read.next() => incoming,
                    };

                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<ServerMessage>(&text) {
                                Ok(ServerMessage::Processing) => {}
                                Ok(ServerMessage::Message { content }) => {
                                    if tx.send(Ok(content)).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(ServerMessage::Done { .. }) => {
                                    break;
                                }
                                Ok(ServerMessage::Cancelled) => {
                                    let _ = tx.send(Err("relay cancelled the reply".into())).await;
                                    break;
                                }
                                Ok(ServerMessage::Error { message }) => {
                                    let _ = tx.send(Err(message.into())).await;
                                    break;
                                }
                                Err(e) => {
                                    warn!("Skipping unreadable relay frame: {}", e);
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            let _ = tx.send(
                                Err("relay closed the connection before the reply finished".into())
                            ).await;
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = tx.send(Err(Box::new(e) as BoxError)).await;
                            return;
                        }
                    }
                }
                let _ = write.close().await;
            })
        )
    }
}
