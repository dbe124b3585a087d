use crate::{
    config::ClientConfig,
    connection::{ConnectionEvent, ReconnectPolicy, StreamConnection},
    transport::{EventTransport, InitiationError, SearchRequest, TaskInitiator},
};
use chrono::{DateTime, Utc};
use infoseek_core::{
    board::IgnoredEvent, decode_event, AgentRecord, BoardEffect, FinalResult, ProgressBoard,
    StreamEvent, TimelineEntry, TimelineKind, TimelineRecorder,
};
use serde::Serialize;
use std::{fmt, sync::Arc};
use thiserror::Error;
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
};
use tracing::{debug, info, warn};

/// Agent name used for timeline entries that belong to the search as a whole.
pub const SESSION_TIMELINE_AGENT: &str = "Search Orchestrator";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Streaming)
    }

    /// Completed, Failed or Closed: nothing more will arrive without a new `start`.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Closed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub agents: Vec<AgentRecord>,
    pub timeline: Vec<TimelineEntry>,
    pub final_result: Option<FinalResult>,
    pub error_message: Option<String>,
}

impl SessionSnapshot {
    pub fn agent(&self, name: &str) -> Option<&AgentRecord> {
        self.agents.iter().find(|record| record.name == name)
    }

    pub fn important_timeline(&self) -> impl Iterator<Item = &TimelineEntry> {
        self.timeline.iter().filter(|entry| entry.important)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("search already running ({0})")]
    AlreadyRunning(SessionState),
}

enum Step {
    Initiated(Result<Result<(), InitiationError>, JoinError>),
    Connection(Option<ConnectionEvent>),
}

/// One search attempt at a time: owns the stream connection, the progress
/// board and the timeline, and publishes a snapshot after every accepted event.
pub struct SearchSession<T, I> {
    transport: Arc<T>,
    initiator: Arc<I>,
    reconnect: ReconnectPolicy,
    state: SessionState,
    session_id: Option<String>,
    pending_request: Option<SearchRequest>,
    connection: Option<StreamConnection<T>>,
    initiation: Option<JoinHandle<Result<(), InitiationError>>>,
    board: ProgressBoard,
    timeline: TimelineRecorder,
    error_message: Option<String>,
    snapshot_tx: watch::Sender<Arc<SessionSnapshot>>,
}

impl<T: EventTransport, I: TaskInitiator> SearchSession<T, I> {
    pub fn new(config: &ClientConfig, transport: Arc<T>, initiator: Arc<I>) -> Self {
        let board = ProgressBoard::new(config.roster.iter().cloned(), config.unknown_agents);
        let timeline = TimelineRecorder::new(config.timeline_capacity);
        let initial = SessionSnapshot {
            state: SessionState::Idle,
            session_id: None,
            agents: board.agents().to_vec(),
            timeline: Vec::new(),
            final_result: None,
            error_message: None,
        };
        let (snapshot_tx, _) = watch::channel(Arc::new(initial));
        Self {
            transport,
            initiator,
            reconnect: config.reconnect,
            state: SessionState::Idle,
            session_id: None,
            pending_request: None,
            connection: None,
            initiation: None,
            board,
            timeline,
            error_message: None,
            snapshot_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn board(&self) -> &ProgressBoard {
        &self.board
    }

    pub fn timeline(&self) -> &TimelineRecorder {
        &self.timeline
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn is_streaming_connection_live(&self) -> bool {
        self.connection
            .as_ref()
            .map(StreamConnection::is_active)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Resets all per-attempt state and opens the stream. The task itself is
    /// initiated once the stream reports it is open.
    pub fn start(&mut self, request: SearchRequest) -> Result<String, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if self.state.is_running() {
            return Err(SessionError::AlreadyRunning(self.state));
        }

        self.teardown();
        self.board.reset();
        self.timeline.clear();
        self.error_message = None;

        let session_id = request
            .session_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        info!(
            event = "session_start",
            session_id = %session_id,
            query_len = request.query.len(),
            include_web = request.include_web,
            include_rag = request.include_rag
        );

        let mut connection =
            StreamConnection::new(self.transport.clone(), session_id.clone(), self.reconnect);
        connection.connect();
        self.connection = Some(connection);
        self.pending_request = Some(request);
        self.session_id = Some(session_id.clone());
        self.state = SessionState::Connecting;
        self.publish();
        Ok(session_id)
    }

    /// Waits for the next connection event or the initiation outcome and
    /// applies it. `None` once there is no live connection left to read from.
    /// Cancel-safe: dropping the future loses nothing.
    pub async fn next_event(&mut self) -> Option<Arc<SessionSnapshot>> {
        let connection = self.connection.as_mut()?;
        let step = match self.initiation.as_mut() {
            Some(initiation) => tokio::select! {
                biased;
                event = connection.next_event() => Step::Connection(event),
                joined = initiation => Step::Initiated(joined),
            },
            None => Step::Connection(connection.next_event().await),
        };
        match step {
            Step::Initiated(joined) => {
                self.initiation = None;
                self.handle_initiation(joined);
            }
            Step::Connection(Some(event)) => self.handle_connection_event(event),
            Step::Connection(None) => return None,
        }
        Some(self.snapshot())
    }

    /// Drives the session until it completes, fails or loses its connection.
    pub async fn run_until_settled(&mut self) -> Arc<SessionSnapshot> {
        while !self.state.is_settled() {
            if self.next_event().await.is_none() {
                break;
            }
        }
        self.snapshot()
    }

    /// Consumer teardown. Safe to call any number of times.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.teardown();
        self.pending_request = None;
        self.state = SessionState::Closed;
        info!(
            event = "session_closed",
            session_id = self.session_id.as_deref().unwrap_or("-")
        );
        self.publish();
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Open => self.handle_open(),
            ConnectionEvent::Message(raw) => self.handle_message(&raw, Utc::now()),
            ConnectionEvent::Failed(err) => {
                if self.state.is_running() {
                    self.fail(err.to_string(), Utc::now());
                }
            }
        }
    }

    fn handle_open(&mut self) {
        if !self.state.is_running() {
            return;
        }
        if self.state == SessionState::Connecting {
            self.state = SessionState::Streaming;
            self.publish();
        }

        let Some(request) = self.pending_request.take() else {
            return;
        };
        let Some(session_id) = self.session_id.clone() else {
            return;
        };
        debug!(event = "session_task_initiating", session_id = %session_id);
        self.initiation = Some(tokio::spawn(self.initiator.initiate(&session_id, &request)));
    }

    fn handle_initiation(&mut self, joined: Result<Result<(), InitiationError>, JoinError>) {
        let outcome = match joined {
            Ok(Ok(())) => {
                info!(
                    event = "session_task_initiated",
                    session_id = self.session_id.as_deref().unwrap_or("-")
                );
                return;
            }
            Ok(Err(err)) => err.to_string(),
            Err(err) => err.to_string(),
        };
        if self.state.is_running() {
            self.fail(format!("task initiation failed: {outcome}"), Utc::now());
        }
    }

    fn handle_message(&mut self, raw: &str, received_at: DateTime<Utc>) {
        if !self.state.is_running() {
            debug!(event = "session_event_dropped", state = %self.state);
            return;
        }

        let event = decode_event(raw);
        debug!(event = "session_event_decoded", kind = event.kind());
        match &event {
            StreamEvent::Heartbeat => return,
            StreamEvent::Unrecognized(err) => {
                warn!(
                    event = "stream_protocol_error",
                    session_id = self.session_id.as_deref().unwrap_or("-"),
                    error = %err
                );
                return;
            }
            _ => {}
        }

        match self.board.apply(event, received_at) {
            BoardEffect::AgentUpdated { agent, timeline } => {
                debug!(event = "session_agent_updated", agent = %agent);
                if let Some(note) = timeline {
                    self.timeline
                        .record(note.agent, note.message, note.kind, note.timestamp);
                }
                self.publish();
            }
            BoardEffect::ResultAccepted => {
                let sources = self
                    .board
                    .final_result()
                    .map(|result| result.sources.len())
                    .unwrap_or(0);
                self.timeline.record(
                    SESSION_TIMELINE_AGENT,
                    format!("Search completed with {sources} sources"),
                    TimelineKind::FinalResult,
                    received_at,
                );
                // the backend has produced its answer; let the acknowledgement finish
                self.initiation = None;
                self.teardown();
                self.pending_request = None;
                self.state = SessionState::Completed;
                info!(
                    event = "session_completed",
                    session_id = self.session_id.as_deref().unwrap_or("-"),
                    sources
                );
                self.publish();
            }
            BoardEffect::Failed { message } => self.fail(message, received_at),
            BoardEffect::Ignored(IgnoredEvent::UnknownAgent(agent)) => {
                info!(event = "session_unknown_agent", agent = %agent);
            }
            BoardEffect::Ignored(reason) => {
                debug!(event = "session_event_ignored", reason = ?reason);
            }
        }
    }

    fn fail(&mut self, message: String, at: DateTime<Utc>) {
        warn!(
            event = "session_failed",
            session_id = self.session_id.as_deref().unwrap_or("-"),
            error = %message
        );
        self.teardown();
        self.pending_request = None;
        self.timeline
            .record(SESSION_TIMELINE_AGENT, message.clone(), TimelineKind::Error, at);
        self.error_message = Some(message);
        self.state = SessionState::Failed;
        self.publish();
    }

    fn teardown(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.disconnect();
        }
        if let Some(initiation) = self.initiation.take() {
            initiation.abort();
        }
    }

    fn publish(&self) {
        let snapshot = SessionSnapshot {
            state: self.state,
            session_id: self.session_id.clone(),
            agents: self.board.agents().to_vec(),
            timeline: self.timeline.entries().cloned().collect(),
            final_result: self.board.final_result().cloned(),
            error_message: self.error_message.clone(),
        };
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}

impl<T, I> Drop for SearchSession<T, I> {
    fn drop(&mut self) {
        if let Some(initiation) = self.initiation.take() {
            initiation.abort();
        }
    }
}
