use serde::{ Serialize, Deserialize };

use super::chat::Message;
use super::settings::{ SamplingOverrides, Settings };

/// A relay request: the full ordered history, already including the new user turn.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamRequest {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Settings>,
    #[serde(default, flatten)]
    pub overrides: SamplingOverrides,
}

/// Older clients send the new turn separately from the history.
#[derive(Clone, Debug, Deserialize)]
pub struct LegacyStreamRequest {
    #[serde(default)]
    pub action: Option<String>,
    pub message: String,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(flatten)]
    pub overrides: SamplingOverrides,
}

impl From<LegacyStreamRequest> for StreamRequest {
    fn from(legacy: LegacyStreamRequest) -> Self {
        let mut messages = legacy.history;
        messages.push(Message::user(legacy.message));
        StreamRequest {
            messages,
            settings: None,
            overrides: legacy.overrides,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "stream")] Stream(StreamRequest),
    #[serde(rename = "cancel")]
    Cancel,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "message")] Message {
        content: String,
    },
    #[serde(rename = "done")] Done {
        done: bool,
        timestamp: i64,
    },
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "error")] Error {
        message: String,
    },
}

/// One line of the NDJSON streaming response.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum StreamFrame {
    Token {
        token: String,
    },
    Done {
        done: bool,
    },
    Error {
        error: String,
    },
}

fn parse_legacy(text: &str) -> Result<StreamRequest, serde_json::Error> {
    let legacy = serde_json::from_str::<LegacyStreamRequest>(text)?;
    match legacy.action.as_deref() {
        None | Some("stream") => Ok(legacy.into()),
        Some(other) => {
            Err(serde::de::Error::custom(format!("unsupported action '{}'", other)))
        }
    }
}

/// Parses a WebSocket text frame, accepting the tagged form or the legacy `action` form.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, serde_json::Error> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => Ok(msg),
        Err(e) => parse_legacy(text).map(ClientMessage::Stream).map_err(|_| e),
    }
}

/// Parses an HTTP streaming body in either shape.
pub fn parse_stream_request(body: &[u8]) -> Result<StreamRequest, serde_json::Error> {
    let text = std::str::from_utf8(body)
        .map_err(<serde_json::Error as serde::de::Error>::custom)?;
    match serde_json::from_str::<StreamRequest>(text) {
        Ok(req) => Ok(req),
        Err(e) => parse_legacy(text).map_err(|_| e),
    }
}
