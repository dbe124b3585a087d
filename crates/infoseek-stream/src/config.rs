use crate::connection::ReconnectPolicy;
use infoseek_core::{
    UnknownAgentPolicy, DEFAULT_MAX_FRAME_BYTES, DEFAULT_ROSTER, DEFAULT_TIMELINE_CAPACITY,
};
use std::time::Duration;
use tracing::warn;
use url::{ParseError, Url};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_STREAM_PATH: &str = "/api/v1/search/progress/{session_id}";
pub const DEFAULT_INITIATE_PATH: &str = "/api/v1/search/multi-agent";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const SESSION_ID_PLACEHOLDER: &str = "{session_id}";

#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    pub base_url: String,
    pub stream_path: String,
    pub initiate_path: String,
    pub reconnect: ReconnectPolicy,
    pub request_timeout: Duration,
    pub roster: Vec<String>,
    pub unknown_agents: UnknownAgentPolicy,
    pub timeline_capacity: usize,
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            initiate_path: DEFAULT_INITIATE_PATH.to_string(),
            reconnect: ReconnectPolicy::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            roster: DEFAULT_ROSTER.iter().map(|name| name.to_string()).collect(),
            unknown_agents: UnknownAgentPolicy::default(),
            timeline_capacity: DEFAULT_TIMELINE_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = read("INFOSEEK_BASE_URL") {
            config.base_url = value;
        }
        if let Some(value) = read("INFOSEEK_STREAM_PATH") {
            config.stream_path = value;
        }
        if let Some(value) = read("INFOSEEK_INITIATE_PATH") {
            config.initiate_path = value;
        }
        let read_num = |key: &str| read(key).and_then(|value| parse_num(&value, key));

        if let Some(ms) = read_num("INFOSEEK_RECONNECT_INITIAL_MS") {
            config.reconnect.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = read_num("INFOSEEK_RECONNECT_MAX_MS") {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = read_num("INFOSEEK_RECONNECT_ATTEMPTS") {
            config.reconnect.max_attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        }
        if let Some(capacity) = read_num("INFOSEEK_TIMELINE_CAPACITY") {
            config.timeline_capacity = usize::try_from(capacity).unwrap_or(usize::MAX).max(1);
        }
        if let Some(value) = read("INFOSEEK_ROSTER") {
            let roster: Vec<String> = value
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
            if !roster.is_empty() {
                config.roster = roster;
            }
        }
        if let Some(value) = read("INFOSEEK_UNKNOWN_AGENTS") {
            match value.parse::<UnknownAgentPolicy>() {
                Ok(policy) => config.unknown_agents = policy,
                Err(err) => warn!(
                    event = "config_invalid_value",
                    key = "INFOSEEK_UNKNOWN_AGENTS",
                    error = %err
                ),
            }
        }
        config
    }

    /// The session id always lands in a single percent-encoded path segment.
    pub fn stream_url(&self, session_id: &str) -> Result<Url, ParseError> {
        join_url(&self.base_url, &self.stream_path, Some(session_id))
    }

    pub fn initiate_url(&self) -> Result<Url, ParseError> {
        join_url(&self.base_url, &self.initiate_path, None)
    }
}

fn join_url(base: &str, path: &str, session_id: Option<&str>) -> Result<Url, ParseError> {
    let mut url = Url::parse(base)?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| ParseError::RelativeUrlWithCannotBeABaseBase)?;
        segments.pop_if_empty();
        let mut placed = false;
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            match session_id {
                Some(id) if segment.contains(SESSION_ID_PLACEHOLDER) => {
                    segments.push(&segment.replace(SESSION_ID_PLACEHOLDER, id));
                    placed = true;
                }
                _ => {
                    segments.push(segment);
                }
            }
        }
        if let (Some(id), false) = (session_id, placed) {
            segments.push(id);
        }
    }
    Ok(url)
}

fn parse_num(value: &str, key: &str) -> Option<u64> {
    match value.parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(event = "config_invalid_value", key, value, error = %err);
            None
        }
    }
}
