use crate::AgentStatus;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::VecDeque;

pub const DEFAULT_TIMELINE_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineKind {
    Status(AgentStatus),
    FinalResult,
    Error,
}

impl TimelineKind {
    pub fn as_str(&self) -> &str {
        match self {
            TimelineKind::Status(status) => status.as_str(),
            TimelineKind::FinalResult => "final_result",
            TimelineKind::Error => "error",
        }
    }

    pub fn is_important(&self) -> bool {
        match self {
            TimelineKind::Status(status) => status.is_important(),
            TimelineKind::FinalResult | TimelineKind::Error => true,
        }
    }
}

impl Serialize for TimelineKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub id: u64,
    pub agent: String,
    pub message: String,
    pub kind: TimelineKind,
    pub timestamp: DateTime<Utc>,
    pub important: bool,
}

/// Bounded activity log. Entries are never deduplicated or edited; a replayed
/// event shows up twice.
#[derive(Debug, Clone)]
pub struct TimelineRecorder {
    capacity: usize,
    entries: VecDeque<TimelineEntry>,
    next_id: u64,
}

impl TimelineRecorder {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            next_id: 1,
        }
    }

    pub fn record(
        &mut self,
        agent: impl Into<String>,
        message: impl Into<String>,
        kind: TimelineKind,
        timestamp: DateTime<Utc>,
    ) -> &TimelineEntry {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        let important = kind.is_important();
        let entry = TimelineEntry {
            id: self.next_id,
            agent: agent.into(),
            message: message.into(),
            kind,
            timestamp,
            important,
        };
        self.next_id += 1;
        self.entries.push_back(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> impl Iterator<Item = &TimelineEntry> {
        self.entries.iter()
    }

    pub fn important(&self) -> impl Iterator<Item = &TimelineEntry> {
        self.entries.iter().filter(|entry| entry.important)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Ids keep counting across clears so they stay unique for the recorder's lifetime.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for TimelineRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_TIMELINE_CAPACITY)
    }
}
