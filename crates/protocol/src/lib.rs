//! Gateway wire protocol: frame codec, close codes and channel-name rules.
//!
//! All communication uses JSON frames of the shape `{ "t": <type>, "d": <data> }`.
//! This module implements only the short-name schema (`t/d/s/c/e/ip/pid/sid`);
//! no long-name variant is supported.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

pub const MAX_FRAME_BYTES: usize = 1_048_576;
pub const MAX_CHANNELS: usize = 500;
pub const MAX_MESSAGES_PER_SECOND: u32 = 10;

pub const WRITE_WAIT: Duration = Duration::from_secs(10);
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// `pongWait * 0.9`.
pub const PING_PERIOD: Duration = Duration::from_millis(54_000);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Framed-connection close codes. Meanings fixed by the wire protocol.
pub mod close_codes {
    pub const AUTH_FAILED: u16 = 4001;
    pub const CAPABILITY_PARSE_ERROR: u16 = 4005;
    pub const PING_TIMEOUT: u16 = 4008;
    pub const SHUTTING_DOWN: u16 = 4009;
    pub const INVALID_FRAME: u16 = 4010;
    pub const RATE_LIMITED: u16 = 4029;
    pub const INTERNAL_ERROR: u16 = 4500;
}

pub const SHUTDOWN_REASON: &str = "please reconnect";

// ── Channel names ────────────────────────────────────────────────────────────

fn channel_name_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^[A-Za-z0-9_-]{1,255}$").unwrap()
    })
}

#[must_use]
pub fn is_valid_channel_name(name: &str) -> bool {
    channel_name_regex().is_match(name)
}

/// Build the `<app-id>:<channel-name>` key used on the bus and in the hub's maps.
#[must_use]
pub fn qualify_channel(app_id: &str, channel: &str) -> String {
    format!("{app_id}:{channel}")
}

/// Split a qualified channel back into `(app_id, channel)`. Returns `None`
/// unless the string splits on `:` into exactly two non-empty parts.
#[must_use]
pub fn split_qualified_channel(qualified: &str) -> Option<(&str, &str)> {
    let mut parts = qualified.splitn(2, ':');
    let app = parts.next()?;
    let channel = parts.next()?;
    if app.is_empty() || channel.is_empty() || channel.contains(':') {
        return None;
    }
    Some((app, channel))
}

// ── Inbound frames (client → server) ────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct Envelope {
    t: String,
    #[serde(default)]
    d: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeData {
    pub s: i64,
    pub c: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnsubscribeData {
    pub s: i64,
    pub c: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishData {
    pub s: i64,
    #[serde(default)]
    pub ip: bool,
    pub c: String,
    pub e: String,
    #[serde(default)]
    pub d: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum InboundFrame {
    Subscribe(SubscribeData),
    Unsubscribe(UnsubscribeData),
    Publish(PublishData),
    /// A frame with a `t` this server does not recognize; dropped silently.
    Unknown,
}

/// Why a text message could not be turned into an [`InboundFrame`].
#[derive(Debug, Clone)]
pub enum DecodeError {
    /// The message wasn't `{ "t": ..., "d": ... }` at all — close the connection.
    InvalidFrame,
    /// `t` was recognized but `d` didn't match that type's schema — reply with
    /// an `error` frame carrying `s` when it could be recovered.
    InvalidData { s: Option<i64> },
}

fn recover_s(value: &serde_json::Value) -> Option<i64> {
    value.get("s").and_then(serde_json::Value::as_i64)
}

/// Decode one inbound text frame.
pub fn decode_inbound(text: &str) -> Result<InboundFrame, DecodeError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|_| DecodeError::InvalidFrame)?;
    match envelope.t.as_str() {
        "subscribe" => serde_json::from_value(envelope.d.clone())
            .map(InboundFrame::Subscribe)
            .map_err(|_| DecodeError::InvalidData { s: recover_s(&envelope.d) }),
        "unsubscribe" => serde_json::from_value(envelope.d.clone())
            .map(InboundFrame::Unsubscribe)
            .map_err(|_| DecodeError::InvalidData { s: recover_s(&envelope.d) }),
        "publish" => serde_json::from_value(envelope.d.clone())
            .map(InboundFrame::Publish)
            .map_err(|_| DecodeError::InvalidData { s: recover_s(&envelope.d) }),
        _ => Ok(InboundFrame::Unknown),
    }
}

// ── Outbound frames (server → client) ───────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "t", content = "d")]
pub enum OutboundFrame {
    #[serde(rename = "hello")]
    Hello { sid: String },
    #[serde(rename = "subscribe_success")]
    SubscribeSuccess { s: i64 },
    #[serde(rename = "unsubscribe_success")]
    UnsubscribeSuccess { s: i64 },
    #[serde(rename = "publish_success")]
    PublishSuccess { s: i64 },
    #[serde(rename = "publish")]
    Publish {
        c: String,
        e: String,
        d: serde_json::Value,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        s: Option<i64>,
        t: String,
        r: String,
    },
}

impl OutboundFrame {
    #[must_use]
    pub fn error(s: Option<i64>, reason: impl Into<String>) -> Self {
        Self::Error {
            s,
            t: "error".into(),
            r: reason.into(),
        }
    }

    /// Serialize to the JSON text sent on the wire. Infallible in practice —
    /// every variant here is built from already-valid data.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"t":"error","d":{"t":"error","r":"internal encode failure"}}"#.into()
        })
    }
}

// ── Inter-node bus payload ───────────────────────────────────────────────────

/// Published on the bus subject `channel_publish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusPublish {
    pub c: String,
    pub e: String,
    pub d: serde_json::Value,
    /// Empty string means "deliver to every local subscriber, including the
    /// publisher"; otherwise the session id to exclude.
    #[serde(default)]
    pub pid: String,
}

pub const BUS_SUBJECT: &str = "channel_publish";
