use crate::cli::Args;
use crate::llm::chat::{ BoxError, TokenStream };
use crate::models::websocket::{ parse_client_message, ClientMessage, ServerMessage };
use crate::relay::Relay;

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::io::{ AsyncRead, AsyncWrite };

use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };
use tokio_tungstenite::tungstenite::handshake::server::{ Request, Response, ErrorResponse };
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_rustls::TlsAcceptor;

use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };
use chrono::Utc;
use url::form_urlencoded;

use log::{ info, warn, error, debug };
use futures::{ Sink, SinkExt, StreamExt };

const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
const STREAM_PATHS: [&str; 3] = ["/api/stream", "/api/chat", "/"];

type ConnectionLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Clone, Default)]
pub struct WsOptions {
    pub api_key: Option<String>,
    pub max_connections_per_sec: u32,
    pub tls: Option<TlsAcceptor>,
}

impl WsOptions {
    pub fn from_args(args: &Args) -> Result<Self, BoxError> {
        let tls = if args.enable_tls {
            match (&args.tls_cert_path, &args.tls_key_path) {
                (Some(cert_path), Some(key_path)) => {
                    info!(
                        "TLS enabled. Loading certificate from '{}' and key from '{}'",
                        cert_path,
                        key_path
                    );
                    Some(super::tls::load_tls_acceptor(cert_path, key_path)?)
                }
                _ => {
                    error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                    return Err("Missing TLS certificate or key path".into());
                }
            }
        } else {
            info!("TLS not enabled. Running plain WebSocket (WS) server.");
            None
        };

        let api_key = args.server_api_key.clone().filter(|k| !k.trim().is_empty());
        if api_key.is_some() {
            info!("WebSocket relay configured with API Key authentication.");
        } else {
            warn!("WebSocket relay configured WITHOUT API Key authentication. Connections are open.");
        }

        Ok(Self {
            api_key,
            max_connections_per_sec: args.max_connections_per_sec,
            tls,
        })
    }
}

pub async fn start_ws_server(
    addr: &str,
    relay: Arc<Relay>,
    args: &Args,
) -> Result<(), BoxError> {
    let options = WsOptions::from_args(args)?;
    let listener = TcpListener::bind(addr).await?;
    let protocol = if options.tls.is_some() { "wss" } else { "ws" };
    info!("{} relay listening on: {}", protocol.to_uppercase(), addr);
    serve(listener, relay, options).await
}

/// Accept loop. Each connection runs on its own task.
pub async fn serve(
    listener: TcpListener,
    relay: Arc<Relay>,
    options: WsOptions,
) -> Result<(), BoxError> {
    let per_second = NonZeroU32::new(options.max_connections_per_sec).unwrap_or(NonZeroU32::MIN);
    let limiter: Arc<ConnectionLimiter> = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

    loop {
        let (stream, peer) = listener.accept().await?;

        if limiter.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let relay = Arc::clone(&relay);
        let required_api_key = options.api_key.clone();
        let tls_acceptor = options.tls.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = tls_acceptor {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!("TLS handshake successful for {}", peer);
                        process_connection(peer, tls_stream, relay, required_api_key).await
                    }
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as BoxError)
                    }
                }
            } else {
                process_connection(peer, stream, relay, required_api_key).await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(body.to_string()));
    *resp.status_mut() = status;
    resp
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    relay: Arc<Relay>,
    required_api_key: Option<String>,
) -> Result<(), BoxError>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let handshake = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = req.uri().path();
        if !STREAM_PATHS.contains(&path) {
            warn!("{}: rejected handshake for unknown path {}", peer, path);
            return Err(reject(StatusCode::NOT_FOUND, "Not Found"));
        }

        let Some(required) = required_api_key.as_deref() else {
            debug!("{} no API key required", peer);
            return Ok(response);
        };

        let from_header = req
            .headers()
            .get("X-API-Key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let provided = from_header.or_else(|| {
            form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
                .find(|(k, _)| k == "api_key")
                .map(|(_, v)| v.into_owned())
        });

        if provided.as_deref() == Some(required) {
            info!("{} authenticated", peer);
            Ok(response)
        } else {
            warn!("{}: bad or missing API key", peer);
            Err(reject(StatusCode::UNAUTHORIZED, "Unauthorized"))
        }
    };

    match accept_hdr_async(stream, handshake).await {
        Ok(ws) => {
            handle_connection(peer, ws, relay).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

async fn send_frame<T>(tx: &mut T, peer: SocketAddr, frame: &ServerMessage) -> bool
    where T: Sink<Message> + Unpin, T::Error: std::fmt::Display
{
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode frame for {}: {}", peer, e);
            return false;
        }
    };
    match tx.send(Message::Text(json)).await {
        Ok(()) => true,
        Err(e) => {
            error!("Error sending frame to {}: {}", peer, e);
            false
        }
    }
}

async fn next_chunk(active: &mut Option<TokenStream>) -> Option<Result<String, BoxError>> {
    match active {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Per-connection relay loop.
///
/// Idle until a stream request arrives, then Streaming until the backend finishes,
/// fails, or the client cancels or disconnects. Each Streaming episode ends with
/// exactly one `done`, `cancelled` or `error` frame. Dropping the token stream
/// aborts the backend request.
pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    relay: Arc<Relay>,
)
    where S: AsyncRead + AsyncWrite + Unpin
{
    info!("New WebSocket connection: {}", peer);

    let (mut tx, mut rx) = websocket.split();
    let mut active: Option<TokenStream> = None;
    let mut chunks_sent = 0usize;

    loop {
        tokio::select! {
            incoming = rx.next() => {
                let Some(incoming) = incoming else {
                    break;
                };
                let message = match incoming {
                    Ok(message) => message,
                    Err(e) => {
                        match e {
                            | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                            | tokio_tungstenite::tungstenite::Error::Protocol(_)
                            | tokio_tungstenite::tungstenite::Error::Utf8 => {
                                info!("WebSocket connection closed or protocol error for {}: {}", peer, e);
                            }
                            tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                                io_err.kind() == std::io::ErrorKind::ConnectionReset
                            => {
                                info!("WebSocket connection reset by peer {}", peer);
                            }
                            tokio_tungstenite::tungstenite::Error::Capacity(ref cap_err) => {
                                error!("WebSocket capacity error for {}: {}", peer, cap_err);
                                let frame = ServerMessage::Error { message: "Server capacity error".to_string() };
                                send_frame(&mut tx, peer, &frame).await;
                            }
                            _ => {
                                error!("Error receiving message from {}: {}", peer, e);
                            }
                        }
                        break;
                    }
                };

                if message.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds size limit ({} > {})",
                        peer,
                        message.len(),
                        MAX_MESSAGE_SIZE
                    );
                    let frame = ServerMessage::Error { message: "Message too large".to_string() };
                    send_frame(&mut tx, peer, &frame).await;
                    break;
                }

                match message {
                    Message::Text(text) => {
                        match parse_client_message(&text) {
                            Ok(ClientMessage::Stream(request)) => {
                                if active.is_some() {
                                    warn!("{} sent a stream request while a reply is streaming", peer);
                                    let frame = ServerMessage::Error {
                                        message: "A reply is already streaming on this connection".to_string(),
                                    };
                                    if !send_frame(&mut tx, peer, &frame).await {
                                        break;
                                    }
                                    continue;
                                }

                                info!("WebSocket stream request from {}: {} messages", peer, request.messages.len());
                                if !send_frame(&mut tx, peer, &ServerMessage::Processing).await {
                                    break;
                                }

                                match relay.open_stream(request).await {
                                    Ok(stream) => {
                                        chunks_sent = 0;
                                        active = Some(stream);
                                    }
                                    Err(e) => {
                                        error!("Error initiating stream for {}: {}", peer, e);
                                        let frame = ServerMessage::Error { message: e.to_string() };
                                        if !send_frame(&mut tx, peer, &frame).await {
                                            break;
                                        }
                                    }
                                }
                            }
                            Ok(ClientMessage::Cancel) => {
                                if active.take().is_some() {
                                    info!("{} cancelled the stream after {} chunks", peer, chunks_sent);
                                    if !send_frame(&mut tx, peer, &ServerMessage::Cancelled).await {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                error!("Failed to parse message from {}: {}", peer, e);
                                let frame = ServerMessage::Error {
                                    message: format!("Failed to parse message: {}", e),
                                };
                                if !send_frame(&mut tx, peer, &frame).await {
                                    break;
                                }
                            }
                        }
                    }
                    Message::Close(_) => {
                        info!("Received close frame from {}", peer);
                        break;
                    }
                    Message::Ping(ping_data) => {
                        if tx.send(Message::Pong(ping_data)).await.is_err() {
                            error!("Failed to send pong to {}", peer);
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Binary(_) => {
                        warn!("Ignoring binary message from {}", peer);
                    }
                    Message::Frame(_) => {}
                }
            }
            chunk = next_chunk(&mut active), if active.is_some() => {
                match chunk {
                    Some(Ok(content)) => {
                        chunks_sent += 1;
                        if !send_frame(&mut tx, peer, &ServerMessage::Message { content }).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        active = None;
                        error!("Stream error for {}: {}", peer, e);
                        let frame = ServerMessage::Error { message: e.to_string() };
                        if !send_frame(&mut tx, peer, &frame).await {
                            break;
                        }
                    }
                    None => {
                        active = None;
                        info!("WebSocket stream to {} completed, sent {} chunks", peer, chunks_sent);
                        let frame = ServerMessage::Done { done: true, timestamp: Utc::now().timestamp() };
                        if !send_frame(&mut tx, peer, &frame).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    if active.take().is_some() {
        info!("Dropping in-flight backend stream for {}", peer);
    }
    info!("WebSocket connection closed for {}", peer);
}
