pub mod board;
pub mod events;
pub mod sse_frame;
pub mod timeline;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use board::{
    AgentRecord, BoardEffect, IgnoredEvent, ProgressBoard, TimelineNote, UnknownAgentPolicy,
};
pub use events::{
    decode_event, FinalResult, ProgressUpdate, ProtocolError, ResultMetadata, SourceDescriptor,
    StreamEvent,
};
pub use sse_frame::{
    DecodeReport, FrameError, SseFrame, SseFrameDecoder, DEFAULT_MAX_FRAME_BYTES,
};
pub use timeline::{TimelineEntry, TimelineKind, TimelineRecorder, DEFAULT_TIMELINE_CAPACITY};

pub const DEFAULT_ROSTER: [&str; 5] = [
    "RAG Specialist",
    "Web Search Specialist",
    "Information Synthesizer",
    "Information Validator",
    "Answer Generator",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AgentStatus {
    Waiting,
    Started,
    Processing,
    RateLimited,
    Completed,
    Failed,
    /// Backend-specific status (`streaming`, `reasoning`, `tool_call`, ...), kept verbatim.
    Other(String),
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Waiting
    }
}

impl AgentStatus {
    pub fn parse(input: &str) -> Self {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "waiting" | "pending" => AgentStatus::Waiting,
            "started" => AgentStatus::Started,
            "processing" => AgentStatus::Processing,
            "rate_limited" | "rate-limited" | "ratelimited" => AgentStatus::RateLimited,
            "completed" | "complete" => AgentStatus::Completed,
            "failed" | "error" => AgentStatus::Failed,
            _ => AgentStatus::Other(normalized),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AgentStatus::Waiting => "waiting",
            AgentStatus::Started => "started",
            AgentStatus::Processing => "processing",
            AgentStatus::RateLimited => "rate_limited",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Other(raw) => raw,
        }
    }

    /// Statuses that also land on the timeline.
    pub fn is_significant(&self) -> bool {
        matches!(
            self,
            AgentStatus::Started
                | AgentStatus::Processing
                | AgentStatus::RateLimited
                | AgentStatus::Completed
                | AgentStatus::Failed
        )
    }

    pub fn is_important(&self) -> bool {
        matches!(
            self,
            AgentStatus::Started
                | AgentStatus::RateLimited
                | AgentStatus::Completed
                | AgentStatus::Failed
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for AgentStatus {
    fn from(value: String) -> Self {
        AgentStatus::parse(&value)
    }
}

impl From<AgentStatus> for String {
    fn from(value: AgentStatus) -> Self {
        value.as_str().to_string()
    }
}
