//! Message events decoded from Moltbot's JSONL session transcripts.
//!
//! Each line of a session log is one self-contained JSON object. Only
//! inbound message records are of interest; anything else is a decode
//! failure that the pipeline counts and drops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Placeholder used when a record omits its channel or sender.
pub const UNKNOWN: &str = "unknown";

/// A single inbound message observed in a session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Transport the message arrived on (e.g. "telegram", "whatsapp").
    pub channel: String,
    /// Opaque sender identity as recorded by Moltbot.
    pub sender: String,
    /// Source timestamp, or ingestion time when absent or unparseable.
    pub timestamp: DateTime<Utc>,
    /// Raw message body. Empty when the record carried none.
    pub text: String,
}

/// Why a raw line could not be turned into a [`MessageEvent`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The line is not valid JSON.
    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The line is JSON but not an object.
    #[error("record is not a JSON object")]
    NotAnObject,
    /// The record is some other kind of log entry (tool call, reply, ...).
    #[error("record is not an input message (type {0:?})")]
    NotAMessage(Option<String>),
}

/// Keys checked for the message body, in order of preference.
const TEXT_KEYS: &[&str] = &["text", "message"];

/// Keys checked for the source timestamp, in order of preference.
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "ts"];

/// Integer timestamps at or above this are epoch milliseconds, below it
/// epoch seconds.
const EPOCH_MILLIS_THRESHOLD: u64 = 100_000_000_000;

/// Decode one raw log line, using the current time as the fallback timestamp.
///
/// # Errors
///
/// Returns a [`DecodeError`] for malformed JSON, non-object values, and
/// records that are not input messages.
pub fn decode(raw_line: &str) -> Result<MessageEvent, DecodeError> {
    decode_at(raw_line, Utc::now())
}

/// Decode one raw log line with an explicit ingestion time.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_at(raw_line: &str, ingested_at: DateTime<Utc>) -> Result<MessageEvent, DecodeError> {
    let value: Value = serde_json::from_str(raw_line.trim())?;
    let Value::Object(record) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let kind = record.get("type").and_then(Value::as_str).map(str::to_owned);
    let text = TEXT_KEYS
        .iter()
        .find_map(|key| record.get(*key).and_then(text_value));

    if text.is_none() && kind.as_deref() != Some("input") {
        return Err(DecodeError::NotAMessage(kind));
    }

    let timestamp = TIMESTAMP_KEYS
        .iter()
        .find_map(|key| record.get(*key).and_then(parse_timestamp))
        .unwrap_or(ingested_at);

    Ok(MessageEvent {
        channel: non_empty_or_unknown(record.get("channel")),
        sender: non_empty_or_unknown(record.get("sender")),
        timestamp,
        text: text.unwrap_or_default(),
    })
}

/// Message bodies are usually strings; content-part arrays are joined.
fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|part| match part {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(obj) => obj.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n"))
        }
        Value::Null | Value::Object(_) => None,
    }
}

/// RFC 3339 strings, or epoch seconds / milliseconds as numbers or strings.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
            .or_else(|| s.trim().parse::<i64>().ok().and_then(from_epoch)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.to_string().split('.').next()?.parse().ok())
            .and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    if raw.unsigned_abs() >= EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(raw)
    } else {
        DateTime::from_timestamp(raw, 0)
    }
}

/// Identities may be logged as strings or bare numbers (Telegram user IDs).
fn non_empty_or_unknown(value: Option<&Value>) -> String {
    let text = match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    if text.trim().is_empty() {
        UNKNOWN.to_owned()
    } else {
        text
    }
}
