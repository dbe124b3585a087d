use crate::events::{FinalResult, ProgressUpdate, ProtocolError, StreamEvent};
use crate::timeline::TimelineKind;
use crate::AgentStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

const WAITING_MESSAGE: &str = "Waiting to start";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownAgentPolicy {
    #[default]
    Ignore,
    Register,
}

impl UnknownAgentPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnknownAgentPolicy::Ignore => "ignore",
            UnknownAgentPolicy::Register => "register",
        }
    }
}

impl fmt::Display for UnknownAgentPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnknownAgentPolicy {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "ignore" | "drop" => Ok(UnknownAgentPolicy::Ignore),
            "register" | "add" => Ok(UnknownAgentPolicy::Register),
            other => Err(format!("Unknown agent policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    pub name: String,
    pub status: AgentStatus,
    pub message: String,
    pub result: Option<String>,
    pub details: Option<Value>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl AgentRecord {
    pub fn waiting(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: AgentStatus::Waiting,
            message: WAITING_MESSAGE.to_string(),
            result: None,
            details: None,
            last_updated: None,
        }
    }

    fn merge(&mut self, update: ProgressUpdate, merged_at: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(message) = update.message {
            self.message = message;
        }
        if let Some(result) = update.result_preview {
            self.result = Some(result);
        }
        if let Some(details) = update.details {
            self.details = Some(details);
        }
        self.last_updated = Some(merged_at);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineNote {
    pub agent: String,
    pub message: String,
    pub kind: TimelineKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IgnoredEvent {
    Heartbeat,
    UnknownAgent(String),
    DuplicateResult,
    Unrecognized(ProtocolError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoardEffect {
    AgentUpdated {
        agent: String,
        timeline: Option<TimelineNote>,
    },
    ResultAccepted,
    Failed {
        message: String,
    },
    Ignored(IgnoredEvent),
}

/// Per-agent progress plus the single final result of one search attempt.
#[derive(Debug, Clone)]
pub struct ProgressBoard {
    roster: Vec<String>,
    unknown_agents: UnknownAgentPolicy,
    agents: Vec<AgentRecord>,
    final_result: Option<FinalResult>,
}

impl ProgressBoard {
    pub fn new<I, S>(roster: I, unknown_agents: UnknownAgentPolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut roster: Vec<String> = roster.into_iter().map(Into::into).collect();
        let mut seen = std::collections::HashSet::new();
        roster.retain(|name| seen.insert(name.clone()));
        let agents = roster.iter().map(AgentRecord::waiting).collect();
        Self {
            roster,
            unknown_agents,
            agents,
            final_result: None,
        }
    }

    /// Back to the roster, all waiting, no result.
    pub fn reset(&mut self) {
        self.agents = self.roster.iter().map(AgentRecord::waiting).collect();
        self.final_result = None;
    }

    pub fn agents(&self) -> &[AgentRecord] {
        &self.agents
    }

    pub fn agent(&self, name: &str) -> Option<&AgentRecord> {
        self.agents.iter().find(|record| record.name == name)
    }

    pub fn final_result(&self) -> Option<&FinalResult> {
        self.final_result.as_ref()
    }

    pub fn apply(&mut self, event: StreamEvent, received_at: DateTime<Utc>) -> BoardEffect {
        match event {
            StreamEvent::Heartbeat => BoardEffect::Ignored(IgnoredEvent::Heartbeat),
            StreamEvent::Unrecognized(err) => {
                BoardEffect::Ignored(IgnoredEvent::Unrecognized(err))
            }
            StreamEvent::ProgressUpdate(update) => self.apply_progress(update, received_at),
            StreamEvent::FinalResult(result) => {
                if self.final_result.is_some() {
                    return BoardEffect::Ignored(IgnoredEvent::DuplicateResult);
                }
                self.final_result = Some(result);
                BoardEffect::ResultAccepted
            }
            StreamEvent::ApplicationError { message } => BoardEffect::Failed { message },
        }
    }

    fn apply_progress(
        &mut self,
        update: ProgressUpdate,
        received_at: DateTime<Utc>,
    ) -> BoardEffect {
        let name = update.agent.trim().to_string();
        let idx = match self.agents.iter().position(|record| record.name == name) {
            Some(idx) => idx,
            None => match self.unknown_agents {
                UnknownAgentPolicy::Ignore => {
                    return BoardEffect::Ignored(IgnoredEvent::UnknownAgent(name));
                }
                UnknownAgentPolicy::Register => {
                    self.agents.push(AgentRecord::waiting(name.clone()));
                    self.agents.len() - 1
                }
            },
        };

        let merged_at = update.timestamp.unwrap_or(received_at);
        let significant = update
            .status
            .as_ref()
            .map(AgentStatus::is_significant)
            .unwrap_or(false);
        let note_message = update
            .message
            .as_deref()
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .map(str::to_string);
        let record = &mut self.agents[idx];
        record.merge(update, merged_at);

        let timeline = significant.then(|| TimelineNote {
            agent: record.name.clone(),
            message: note_message.unwrap_or_else(|| record.status.as_str().to_string()),
            kind: TimelineKind::Status(record.status.clone()),
            timestamp: merged_at,
        });
        BoardEffect::AgentUpdated {
            agent: record.name.clone(),
            timeline,
        }
    }
}

impl Default for ProgressBoard {
    fn default() -> Self {
        Self::new(crate::DEFAULT_ROSTER, UnknownAgentPolicy::default())
    }
}
