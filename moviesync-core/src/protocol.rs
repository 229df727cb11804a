//! Line-delimited JSON protocol for group playback control.
//!
//! Wire format (one JSON object per `\n`-terminated line):
//! ```text
//! {"type":"CONNECT"}                                         member → coordinator
//! {"type":"CONNECTED"}                                       coordinator → member
//! {"type":"SYNC_TIME"}                                       member → coordinator
//! {"type":"SYNC_TIME","data":{"server_now":1700000000000}}   coordinator → member
//! {"type":"PLAY_COMMAND"}                                    member → coordinator
//! {"type":"PLAY_COMMAND","data":{"target_epoch_ms":...}}     coordinator → member
//! {"type":"LOOP_END"}                                        member → coordinator
//! {"type":"ERROR","data":{"message":"..."}}                  either direction
//! ```
//!
//! Only control-plane traffic crosses this channel, so the text framing costs
//! nothing measurable and keeps captures readable. `SYNC_TIME` travels in both
//! directions; a reply is told apart from a request by `data.server_now`.
//!
//! Unknown `type` values are rejected at the parse boundary rather than
//! skipped, so protocol drift between builds shows up as a dropped connection
//! in the logs.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Well-known TCP port the coordinator listens on.
pub const DEFAULT_PORT: u16 = 8888;

/// Longest accepted line, newline excluded. Control messages are tens of bytes.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

const FIELD_SERVER_NOW: &str = "server_now";
const FIELD_TARGET_EPOCH_MS: &str = "target_epoch_ms";
const FIELD_MESSAGE: &str = "message";

/// Closed set of message kinds understood by this protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Connect,
    Connected,
    SyncTimeRequest,
    SyncTimeReply,
    PlayCommand,
    LoopEnd,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Connect,
        MessageKind::Connected,
        MessageKind::SyncTimeRequest,
        MessageKind::SyncTimeReply,
        MessageKind::PlayCommand,
        MessageKind::LoopEnd,
        MessageKind::Error,
    ];

    /// Name carried in the `type` field. Both time-sync directions share `SYNC_TIME`.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::SyncTimeRequest | Self::SyncTimeReply => "SYNC_TIME",
            Self::PlayCommand => "PLAY_COMMAND",
            Self::LoopEnd => "LOOP_END",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SyncTimeRequest => f.write_str("SYNC_TIME(request)"),
            Self::SyncTimeReply => f.write_str("SYNC_TIME(reply)"),
            other => f.write_str(other.wire_name()),
        }
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake opener sent by a joining member.
    Connect,
    /// Handshake acknowledgement from the coordinator.
    Connected,
    /// Member asks for the coordinator's wall clock.
    SyncTimeRequest,
    /// Coordinator wall clock (epoch millis) at the moment it answered.
    SyncTimeReply { server_now: i64 },
    /// Upstream: "please start everyone". Downstream: "start at this epoch".
    PlayCommand { target_epoch_ms: Option<i64> },
    /// A node finished one playback cycle.
    LoopEnd,
    /// Free-form failure report.
    Error { message: Option<String> },
}

/// On-wire shape: `{"type": ..., "data": {...}}`.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Map<String, Value>>,
}

impl Message {
    /// Upstream play request (no target; the coordinator picks one).
    pub fn play_request() -> Self {
        Self::PlayCommand {
            target_epoch_ms: None,
        }
    }

    /// Downstream play command targeting an absolute coordinator epoch.
    pub fn play_at(target_epoch_ms: i64) -> Self {
        Self::PlayCommand {
            target_epoch_ms: Some(target_epoch_ms),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Connect => MessageKind::Connect,
            Self::Connected => MessageKind::Connected,
            Self::SyncTimeRequest => MessageKind::SyncTimeRequest,
            Self::SyncTimeReply { .. } => MessageKind::SyncTimeReply,
            Self::PlayCommand { .. } => MessageKind::PlayCommand,
            Self::LoopEnd => MessageKind::LoopEnd,
            Self::Error { .. } => MessageKind::Error,
        }
    }

    fn data(&self) -> Option<Map<String, Value>> {
        let mut data = Map::new();
        match self {
            Self::SyncTimeReply { server_now } => {
                data.insert(FIELD_SERVER_NOW.into(), Value::from(*server_now));
            }
            Self::PlayCommand {
                target_epoch_ms: Some(target),
            } => {
                data.insert(FIELD_TARGET_EPOCH_MS.into(), Value::from(*target));
            }
            Self::Error {
                message: Some(message),
            } => {
                data.insert(FIELD_MESSAGE.into(), Value::from(message.as_str()));
            }
            _ => return None,
        }
        Some(data)
    }

    /// Serialize to one newline-terminated wire record.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let envelope = Envelope {
            kind: Some(self.kind().wire_name().to_string()),
            data: self.data(),
        };
        let mut line = serde_json::to_vec(&envelope)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }

    /// Parse one record (trailing newline optional).
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let envelope: Envelope =
            serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = envelope.kind.ok_or(ProtocolError::MissingType)?;
        let data = envelope.data.unwrap_or_default();

        match kind.as_str() {
            "CONNECT" => Ok(Self::Connect),
            "CONNECTED" => Ok(Self::Connected),
            "SYNC_TIME" => match int_field(&data, "SYNC_TIME", FIELD_SERVER_NOW)? {
                Some(server_now) => Ok(Self::SyncTimeReply { server_now }),
                None => Ok(Self::SyncTimeRequest),
            },
            "PLAY_COMMAND" => Ok(Self::PlayCommand {
                target_epoch_ms: int_field(&data, "PLAY_COMMAND", FIELD_TARGET_EPOCH_MS)?,
            }),
            "LOOP_END" => Ok(Self::LoopEnd),
            "ERROR" => match data.get(FIELD_MESSAGE) {
                None | Some(Value::Null) => Ok(Self::Error { message: None }),
                Some(Value::String(s)) => Ok(Self::Error {
                    message: Some(s.clone()),
                }),
                Some(_) => Err(ProtocolError::InvalidPayload {
                    kind: "ERROR",
                    field: FIELD_MESSAGE,
                }),
            },
            _ => Err(ProtocolError::UnknownKind(kind)),
        }
    }
}

fn int_field(
    data: &Map<String, Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<Option<i64>, ProtocolError> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or(ProtocolError::InvalidPayload { kind, field }),
    }
}

/// Protocol errors. Always fatal to the connection that produced them.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Message has no type field")]
    MissingType,
    #[error("Unknown message type: {0}")]
    UnknownKind(String),
    #[error("Invalid {field} in {kind} payload")]
    InvalidPayload {
        kind: &'static str,
        field: &'static str,
    },
    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads newline-framed messages from a buffered stream.
pub struct MessageReader<R> {
    inner: R,
    line: String,
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: String::with_capacity(128),
        }
    }

    /// Next message, or `Ok(None)` once the peer has closed the stream.
    pub async fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        self.line.clear();
        let limit = MAX_LINE_BYTES as u64 + 1;
        let read = (&mut self.inner)
            .take(limit)
            .read_line(&mut self.line)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if !self.line.ends_with('\n') && read as u64 >= limit {
            return Err(ProtocolError::LineTooLong(MAX_LINE_BYTES));
        }
        let message = Message::decode(&self.line)?;
        log::trace!("Received {}", message.kind());
        Ok(Some(message))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Encode and write one message, flushing immediately.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), ProtocolError> {
    let line = message.encode()?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    log::trace!("Sent {}", message.kind());
    Ok(())
}
