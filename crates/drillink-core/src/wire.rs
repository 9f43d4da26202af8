//! JSON message vocabulary exchanged with target devices.
//!
//! Outbound commands are wrapped in an envelope carrying an `action` and a
//! `content` object, optionally addressed to one device with `dest`:
//!
//! ```json
//! {"action":"animation_config","dest":"t1",
//!  "content":{"target_id":"t1","action":"ipsc","duration":30.0}}
//! {"action":"forward","dest":"t1",
//!  "content":{"command":"ready","isFirst":true,"isLast":false,"targetType":"ipsc",
//!             "timeout":30.0,"delay":0.0}}
//! {"action":"forward","content":{"command":"start","repeat":1}}
//! {"action":"forward","content":{"command":"end"}}
//! ```
//!
//! Inbound payloads are decoded leniently: devices disagree on where they put
//! their identifier and how they encode numbers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::types::ShotEvent;

/// Errors raised while decoding an inbound payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The payload is not a JSON object.
    #[error("payload is not a JSON object")]
    NotAnObject,

    /// The payload carries no device identifier.
    #[error("payload has no device identifier")]
    MissingDevice,

    /// A required field is absent or has the wrong type.
    #[error("field '{0}' is missing or malformed")]
    InvalidField(&'static str),

    /// The payload is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
}

/// Content of an `animation_config` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationContent {
    pub target_id: String,
    pub action: String,
    pub duration: f64,
}

/// Control command forwarded to one or all devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Ready {
        #[serde(rename = "isFirst")]
        is_first: bool,
        #[serde(rename = "isLast")]
        is_last: bool,
        #[serde(rename = "targetType")]
        target_type: String,
        timeout: f64,
        delay: f64,
    },
    Start {
        repeat: u32,
    },
    End,
}

/// A message sent to the device link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OutboundMessage {
    AnimationConfig {
        dest: String,
        content: AnimationContent,
    },
    Forward {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
        content: Command,
    },
}

impl OutboundMessage {
    /// Device the message is addressed to; `None` means every device.
    #[must_use]
    pub fn dest(&self) -> Option<&str> {
        match self {
            Self::AnimationConfig { dest, .. } => Some(dest),
            Self::Forward { dest, .. } => dest.as_deref(),
        }
    }

    /// The forwarded command, if this is a control message.
    #[must_use]
    pub const fn command(&self) -> Option<&Command> {
        match self {
            Self::Forward { content, .. } => Some(content),
            Self::AnimationConfig { .. } => None,
        }
    }

    /// Serialises the message to its JSON wire form.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Which command an acknowledgement refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ready,
    End,
}

/// A decoded message received from a device.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Acknowledgement of a `ready` or `end` command.
    Ack {
        device: String,
        kind: AckKind,
        status: Option<String>,
    },
    /// A hit notification.
    Shot(ShotEvent),
    /// Anything else carrying a device identifier.
    Other { device: String },
}

impl InboundMessage {
    /// Decodes a raw JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::InvalidJson`] when the text does not parse, and the
    /// errors of [`InboundMessage::decode`] otherwise.
    pub fn decode_str(text: &str) -> Result<Self, WireError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| WireError::InvalidJson(e.to_string()))?;
        Self::decode(&value)
    }

    /// Decodes a structured inbound payload.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] if the payload has no device identifier or a
    /// shot notification is missing a field.
    pub fn decode(value: &Value) -> Result<Self, WireError> {
        let object = value.as_object().ok_or(WireError::NotAnObject)?;
        let content = object.get("content").and_then(Value::as_object);
        let device = device_id(value).ok_or(WireError::MissingDevice)?;

        let ack = object
            .get("action")
            .and_then(Value::as_str)
            .and_then(|action| action.strip_prefix("ack:"))
            .or_else(|| content.and_then(|c| c.get("ack")).and_then(Value::as_str));

        if let Some(ack) = ack {
            let kind = match ack.trim().to_ascii_lowercase().as_str() {
                "ready" => AckKind::Ready,
                "end" => AckKind::End,
                _ => return Ok(Self::Other { device }),
            };
            let status = content
                .and_then(|c| c.get("status"))
                .or_else(|| object.get("status"))
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(Self::Ack {
                device,
                kind,
                status,
            });
        }

        match content {
            Some(c) if c.contains_key("actualHitArea") => {
                Ok(Self::Shot(ShotEvent::from_wire_parts(device, c)?))
            }
            _ => Ok(Self::Other { device }),
        }
    }
}

fn device_id(value: &Value) -> Option<String> {
    ["device", "target_id", "name"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn number_field(
    content: &serde_json::Map<String, Value>,
    key: &'static str,
) -> Result<f64, WireError> {
    match content.get(key) {
        Some(Value::Number(n)) => n.as_f64().ok_or(WireError::InvalidField(key)),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| WireError::InvalidField(key)),
        _ => Err(WireError::InvalidField(key)),
    }
}

impl ShotEvent {
    fn from_wire_parts(
        device: String,
        content: &serde_json::Map<String, Value>,
    ) -> Result<Self, WireError> {
        let hit_area = content
            .get("actualHitArea")
            .and_then(Value::as_str)
            .ok_or(WireError::InvalidField("actualHitArea"))?;
        let time_diff = number_field(content, "actualTimeDiff")?;
        if !time_diff.is_finite() {
            return Err(WireError::InvalidField("actualTimeDiff"));
        }
        let target_type = content
            .get("actualTargetType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(Self::new(device, hit_area, time_diff, target_type))
    }

    /// Encodes the shot in the notification shape devices send.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        json!({
            "device": self.device,
            "content": {
                "actualTimeDiff": self.actual_time_diff,
                "actualHitArea": self.actual_hit_area,
                "actualTargetType": self.actual_target_type,
            }
        })
    }

    /// Decodes a shot notification.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] if the payload is not a shot notification.
    pub fn from_wire(value: &Value) -> Result<Self, WireError> {
        match InboundMessage::decode(value)? {
            InboundMessage::Shot(shot) => Ok(shot),
            _ => Err(WireError::InvalidField("actualHitArea")),
        }
    }
}

/// Builds an acknowledgement payload as a device would send it.
#[must_use]
pub fn ack_payload(device: &str, kind: AckKind) -> Value {
    let ack = match kind {
        AckKind::Ready => "ready",
        AckKind::End => "end",
    };
    json!({ "action": "forward", "device": device, "content": { "ack": ack, "status": "ok" } })
}

/// Longest partial payload kept while waiting for the rest of it.
const MAX_PENDING_BYTES: usize = 16 * 1024;

/// Reassembles JSON payloads split across transport chunks.
///
/// BLE notifications are limited by the link MTU, so one payload may arrive
/// in several pieces and one piece may finish one payload and start the next.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub const fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Bytes received but not yet part of a complete payload.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Appends a chunk and returns every payload it completes.
    ///
    /// Undecodable bytes are skipped up to the next `{`. A partial payload
    /// longer than 16 KiB is dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut values = Vec::new();
        let mut start = 0;
        while start < self.buffer.len() {
            let rest = &self.buffer[start..];
            let mut stream = serde_json::Deserializer::from_slice(rest).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) => {
                    values.push(value);
                    start += stream.byte_offset();
                }
                Some(Err(err)) if err.is_eof() => break,
                Some(Err(err)) => {
                    let skipped = rest[1..]
                        .iter()
                        .position(|b| *b == b'{')
                        .map_or(rest.len(), |pos| pos + 1);
                    tracing::warn!(error = %err, skipped, "Skipping undecodable notification data");
                    start += skipped;
                }
                None => start = self.buffer.len(),
            }
        }

        self.buffer.drain(..start);
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
        }
        if self.buffer.len() > MAX_PENDING_BYTES {
            tracing::warn!(bytes = self.buffer.len(), "Dropping oversized partial notification");
            self.buffer.clear();
        }
        values
    }
}
