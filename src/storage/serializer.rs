//! Message record encoding for the append-only topic logs.
//!
//! Each message is stored as one JSON line in `messages.log`. The encoding is
//! round-trip exact, including the free-form metadata map, so nothing a
//! transport hands us is lost between archive and replay.
//!
//! The read path tolerates a truncated final line. A partial write can only
//! happen between an append and its commit, and the coordinator's recovery
//! step discards exactly that state, so a dangling fragment never represents
//! committed history.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// errors from encoding or decoding persisted message records
#[derive(Debug, Error)]
pub enum SerializationError {
    /// a complete log line failed to parse
    #[error("malformed record at line {line}: {source}")]
    Malformed {
        line: usize,
        source: serde_json::Error,
    },

    /// a record could not be encoded
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// the log file could not be read
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// the caller-supplied metadata map is missing a required field
    #[error("missing metadata field: {0}")]
    MissingField(&'static str),

    /// a metadata field has the wrong shape
    #[error("invalid metadata field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// A single archived message.
///
/// Immutable once committed. Fields that the upstream transport supplies but
/// this layer does not model (chat ids, thread names, platform extras) stay
/// in `metadata` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// UTC time the message was sent
    pub timestamp: DateTime<Utc>,
    /// stable sender identifier
    pub sender_id: String,
    /// display name of the sender, if the transport knows one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// message text
    pub text: String,
    /// content id of an attachment stored in the topic, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    /// free-form transport metadata, preserved verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl MessageRecord {
    /// Build a record from a content payload plus the metadata map supplied
    /// by a transport adapter.
    ///
    /// `sender_id` and `timestamp` (RFC 3339) are required and move into the
    /// typed fields, `sender_name` moves in when present. Everything else,
    /// `chat_id`, `thread_id` and friends included, stays in the metadata map
    /// so the round trip is lossless.
    pub fn from_parts(
        text: impl Into<String>,
        mut metadata: BTreeMap<String, Value>,
    ) -> Result<Self, SerializationError> {
        let sender_id = take_string(&mut metadata, "sender_id")?
            .ok_or(SerializationError::MissingField("sender_id"))?;
        let sender_name = take_string(&mut metadata, "sender_name")?;

        let raw_ts = take_string(&mut metadata, "timestamp")?
            .ok_or(SerializationError::MissingField("timestamp"))?;
        let timestamp = DateTime::parse_from_rfc3339(&raw_ts)
            .map_err(|e| SerializationError::InvalidField {
                field: "timestamp",
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);

        Ok(Self {
            timestamp,
            sender_id,
            sender_name,
            text: text.into(),
            attachment: None,
            metadata,
        })
    }

    /// source thread id from the metadata map, if the transport supplied one
    pub fn thread_id(&self) -> Option<&str> {
        self.metadata.get("thread_id").and_then(Value::as_str)
    }

    /// attach a stored attachment's content id to this record
    pub fn with_attachment(mut self, content_id: impl Into<String>) -> Self {
        self.attachment = Some(content_id.into());
        self
    }
}

fn take_string(
    metadata: &mut BTreeMap<String, Value>,
    field: &'static str,
) -> Result<Option<String>, SerializationError> {
    match metadata.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(SerializationError::InvalidField {
            field,
            reason: format!("expected string, got {}", other),
        }),
    }
}

/// encode a record as one line of durable text (no trailing newline)
///
/// serde_json escapes embedded newlines, so the result is always exactly one
/// line regardless of the message text
pub fn encode(record: &MessageRecord) -> Result<String, SerializationError> {
    Ok(serde_json::to_string(record)?)
}

/// decode one log line back into a record
pub fn decode(line: &str) -> Result<MessageRecord, SerializationError> {
    serde_json::from_str(line).map_err(|source| SerializationError::Malformed { line: 1, source })
}

/// Read every committed record from a topic log.
///
/// A missing file reads as empty. A final line without a terminating newline
/// is a partial write from a crashed operation and is silently excluded; any
/// malformed *complete* line is real corruption and fails the read.
pub fn read_log(path: &Path) -> Result<Vec<MessageRecord>, SerializationError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let complete = match data.rfind('\n') {
        Some(idx) => &data[..idx],
        // no newline at all means the only content is a dangling fragment
        None => return Ok(Vec::new()),
    };

    let mut records = Vec::new();
    for (i, line) in complete.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(line)
            .map_err(|source| SerializationError::Malformed { line: i + 1, source })?;
        records.push(record);
    }

    Ok(records)
}
