use crate::AgentStatus;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

const NESTED_CONTAINER_KEY: &str = "data";

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Heartbeat,
    ProgressUpdate(ProgressUpdate),
    FinalResult(FinalResult),
    ApplicationError { message: String },
    Unrecognized(ProtocolError),
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Heartbeat => "heartbeat",
            StreamEvent::ProgressUpdate(_) => "progress_update",
            StreamEvent::FinalResult(_) => "final_result",
            StreamEvent::ApplicationError { .. } => "error",
            StreamEvent::Unrecognized(_) => "unrecognized",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub agent: String,
    pub status: Option<AgentStatus>,
    pub message: Option<String>,
    pub result_preview: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalResult {
    pub answer: String,
    pub sources: Vec<SourceDescriptor>,
    pub metadata: ResultMetadata,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceDescriptor {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "excerpt", alias = "snippet")]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "deserialize_score")]
    pub relevance_score: Option<f64>,
    #[serde(default, alias = "similarity", deserialize_with = "deserialize_score")]
    pub similarity_score: Option<f64>,
    #[serde(default, alias = "source", alias = "source_kind")]
    pub source_type: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    #[serde(default)]
    pub agents_used: Vec<String>,
    #[serde(default, alias = "source_count")]
    pub total_sources: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_score")]
    pub confidence_score: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_score")]
    pub quality_score: Option<f64>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("payload is not valid json: {0}")]
    InvalidJson(String),
    #[error("payload is not a json object")]
    NotAnObject,
    #[error("payload has no type discriminator")]
    MissingType,
    #[error("unknown event type '{0}'")]
    UnknownType(String),
    #[error("{kind} event is missing required field '{field}'")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

/// Decodes one stream payload. Never fails: anything unusable comes back as
/// [`StreamEvent::Unrecognized`].
pub fn decode_event(raw: &str) -> StreamEvent {
    match try_decode(raw) {
        Ok(event) => event,
        Err(err) => StreamEvent::Unrecognized(err),
    }
}

fn try_decode(raw: &str) -> Result<StreamEvent, ProtocolError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;
    let fields = normalize_fields(value)?;
    let event_type = string_field(&fields, &["type"])
        .ok_or(ProtocolError::MissingType)?
        .trim()
        .to_ascii_lowercase();

    match event_type.as_str() {
        "heartbeat" => Ok(StreamEvent::Heartbeat),
        "progress_update" => decode_progress(&fields).map(StreamEvent::ProgressUpdate),
        "final_result" => decode_final_result(&fields).map(StreamEvent::FinalResult),
        "error" => Ok(StreamEvent::ApplicationError {
            message: string_field(&fields, &["error", "message", "detail"])
                .unwrap_or_else(|| "search failed".to_string()),
        }),
        _ => Err(ProtocolError::UnknownType(event_type)),
    }
}

/// Lifts fields nested under `data` to the top level. Top-level values win.
fn normalize_fields(value: Value) -> Result<Map<String, Value>, ProtocolError> {
    let Value::Object(mut fields) = value else {
        return Err(ProtocolError::NotAnObject);
    };
    match fields.remove(NESTED_CONTAINER_KEY) {
        Some(Value::Object(nested)) => {
            for (key, value) in nested {
                match fields.get(&key) {
                    Some(existing) if !existing.is_null() => {}
                    _ => {
                        fields.insert(key, value);
                    }
                }
            }
        }
        Some(other) => {
            fields.insert(NESTED_CONTAINER_KEY.to_string(), other);
        }
        None => {}
    }
    Ok(fields)
}

fn decode_progress(fields: &Map<String, Value>) -> Result<ProgressUpdate, ProtocolError> {
    let agent = string_field(fields, &["agent", "agent_name"])
        .filter(|agent| !agent.trim().is_empty())
        .ok_or(ProtocolError::MissingField {
            kind: "progress_update",
            field: "agent",
        })?;

    Ok(ProgressUpdate {
        agent,
        status: string_field(fields, &["status"]).map(|status| AgentStatus::parse(&status)),
        message: string_field(fields, &["message"]),
        result_preview: string_field(fields, &["result_preview", "result"]),
        timestamp: string_field(fields, &["timestamp"]).and_then(|raw| parse_timestamp(&raw)),
        details: fields.get("details").filter(|value| !value.is_null()).cloned(),
    })
}

fn decode_final_result(fields: &Map<String, Value>) -> Result<FinalResult, ProtocolError> {
    let answer = string_field(fields, &["result", "answer"]).ok_or(ProtocolError::MissingField {
        kind: "final_result",
        field: "result",
    })?;

    let sources = match fields.get("sources") {
        Some(Value::Array(entries)) => entries.iter().filter_map(decode_source).collect(),
        _ => Vec::new(),
    };

    let metadata = fields
        .get("metadata")
        .filter(|value| value.is_object())
        .and_then(|value| ResultMetadata::deserialize(value).ok())
        .unwrap_or_default();

    Ok(FinalResult {
        answer,
        sources,
        metadata,
    })
}

fn decode_source(entry: &Value) -> Option<SourceDescriptor> {
    match entry {
        Value::Object(_) => SourceDescriptor::deserialize(entry).ok(),
        Value::String(url) => Some(SourceDescriptor {
            title: url.clone(),
            url: Some(url.clone()),
            ..SourceDescriptor::default()
        }),
        _ => None,
    }
}

fn string_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match fields.get(*key) {
        Some(Value::String(value)) => Some(value.clone()),
        Some(Value::Number(value)) => Some(value.to_string()),
        Some(Value::Bool(value)) => Some(value.to_string()),
        _ => None,
    })
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Accepts a score as a number or a numeric string.
fn deserialize_score<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    Ok(match val {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}
