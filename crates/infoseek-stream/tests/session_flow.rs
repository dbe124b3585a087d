use futures_util::{
    future::{self, BoxFuture},
    stream, FutureExt, StreamExt,
};
use infoseek_core::{AgentStatus, TimelineKind, UnknownAgentPolicy};
use infoseek_stream::{
    ClientConfig, EventTransport, InitiationError, PayloadStream, ReconnectPolicy, SearchRequest,
    SearchSession, SessionError, SessionSnapshot, SessionState, TaskInitiator, TransportError,
};
use serde_json::json;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

enum Attempt {
    Refuse,
    Deliver { payloads: Vec<String>, hold: bool },
}

#[derive(Default)]
struct ScriptedTransport {
    attempts: Mutex<VecDeque<Attempt>>,
    opens: AtomicUsize,
    session_ids: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn new(attempts: Vec<Attempt>) -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(attempts.into()),
            ..Self::default()
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl EventTransport for ScriptedTransport {
    fn open(&self, session_id: &str) -> BoxFuture<'static, Result<PayloadStream, TransportError>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.session_ids
            .lock()
            .expect("session ids")
            .push(session_id.to_string());
        let attempt = self
            .attempts
            .lock()
            .expect("attempts")
            .pop_front()
            .unwrap_or(Attempt::Refuse);
        let result = match attempt {
            Attempt::Refuse => Err(TransportError::Status(503)),
            Attempt::Deliver { payloads, hold } => {
                let delivered = stream::iter(payloads.into_iter().map(Ok));
                if hold {
                    Ok(delivered
                        .chain(stream::pending::<Result<String, TransportError>>())
                        .boxed())
                } else {
                    Ok(delivered.boxed())
                }
            }
        };
        future::ready(result).boxed()
    }
}

#[derive(Default)]
struct RecordingInitiator {
    calls: Mutex<Vec<(String, SearchRequest)>>,
    failure: Option<InitiationError>,
}

impl RecordingInitiator {
    fn failing(err: InitiationError) -> Arc<Self> {
        Arc::new(Self {
            failure: Some(err),
            ..Self::default()
        })
    }

    fn calls(&self) -> Vec<(String, SearchRequest)> {
        self.calls.lock().expect("calls").clone()
    }
}

impl TaskInitiator for RecordingInitiator {
    fn initiate(
        &self,
        session_id: &str,
        request: &SearchRequest,
    ) -> BoxFuture<'static, Result<(), InitiationError>> {
        self.calls
            .lock()
            .expect("calls")
            .push((session_id.to_string(), request.clone()));
        let result = match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        };
        future::ready(result).boxed()
    }
}

struct SlowInitiator {
    delay: Duration,
    started: AtomicUsize,
    finished: Arc<AtomicUsize>,
}

impl SlowInitiator {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            started: AtomicUsize::new(0),
            finished: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl TaskInitiator for SlowInitiator {
    fn initiate(
        &self,
        _session_id: &str,
        _request: &SearchRequest,
    ) -> BoxFuture<'static, Result<(), InitiationError>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        let finished = self.finished.clone();
        async move {
            tokio::time::sleep(delay).await;
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts: 5,
        },
        ..ClientConfig::default()
    }
}

fn progress(agent: &str, status: &str, message: &str) -> String {
    json!({"type": "progress_update", "agent": agent, "status": status, "message": message})
        .to_string()
}

fn final_result(answer: &str) -> String {
    json!({
        "type": "final_result",
        "result": answer,
        "sources": [{"title": "S1"}],
        "metadata": {"agents_used": ["RAG Specialist"], "total_sources": 1}
    })
    .to_string()
}

fn held(payloads: Vec<String>) -> Attempt {
    Attempt::Deliver {
        payloads,
        hold: true,
    }
}

async fn settle<T: EventTransport, I: TaskInitiator>(
    session: &mut SearchSession<T, I>,
) -> Arc<SessionSnapshot> {
    tokio::time::timeout(Duration::from_secs(5), session.run_until_settled())
        .await
        .expect("session settles")
}

async fn step<T: EventTransport, I: TaskInitiator>(
    session: &mut SearchSession<T, I>,
) -> Arc<SessionSnapshot> {
    tokio::time::timeout(Duration::from_secs(5), session.next_event())
        .await
        .expect("event arrives")
        .expect("connection live")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completed_search_keeps_last_agent_values_and_result() {
    let transport = ScriptedTransport::new(vec![held(vec![
        progress("RAG Specialist", "started", "Searching knowledge base"),
        json!({"type": "progress_update", "agent": "RAG Specialist", "status": "completed",
               "message": "Found 3 documents", "result": "X"})
        .to_string(),
        final_result("Answer"),
    ])]);
    let initiator = Arc::new(RecordingInitiator::default());
    let mut session = SearchSession::new(&fast_config(), transport.clone(), initiator.clone());

    let session_id = session
        .start(SearchRequest::new("best ramen in osaka"))
        .expect("start");
    assert_eq!(session.state(), SessionState::Connecting);
    let snapshot = settle(&mut session).await;

    assert_eq!(snapshot.state, SessionState::Completed);
    let rag = snapshot.agent("RAG Specialist").expect("rag record");
    assert_eq!(rag.status, AgentStatus::Completed);
    assert_eq!(rag.result.as_deref(), Some("X"));
    let result = snapshot.final_result.as_ref().expect("final result");
    assert_eq!(result.answer, "Answer");
    assert_eq!(result.sources.len(), 1);

    let calls = initiator.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, session_id);
    assert_eq!(calls[0].1.query, "best ramen in osaka");

    let kinds: Vec<&str> = snapshot
        .timeline
        .iter()
        .map(|entry| entry.kind.as_str())
        .collect();
    assert_eq!(kinds, vec!["started", "completed", "final_result"]);
    assert!(!session.is_streaming_connection_live());
    assert_eq!(transport.opens(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_agent_leaves_board_untouched() {
    let transport = ScriptedTransport::new(vec![held(vec![progress(
        "Ghost Agent",
        "started",
        "boo",
    )])]);
    let mut session = SearchSession::new(
        &fast_config(),
        transport,
        Arc::new(RecordingInitiator::default()),
    );
    session.start(SearchRequest::new("q")).expect("start");
    let before = session.snapshot().agents.clone();

    step(&mut session).await;
    let snapshot = step(&mut session).await;

    assert_eq!(snapshot.state, SessionState::Streaming);
    assert_eq!(snapshot.agents, before);
    assert!(snapshot.agent("Ghost Agent").is_none());
    assert!(snapshot.timeline.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_agent_is_added_when_configured() {
    let transport = ScriptedTransport::new(vec![held(vec![progress(
        "Search Orchestrator",
        "started",
        "planning",
    )])]);
    let config = ClientConfig {
        unknown_agents: UnknownAgentPolicy::Register,
        ..fast_config()
    };
    let mut session =
        SearchSession::new(&config, transport, Arc::new(RecordingInitiator::default()));
    session.start(SearchRequest::new("q")).expect("start");

    step(&mut session).await;
    let snapshot = step(&mut session).await;

    assert_eq!(snapshot.agents.len(), 6);
    let added = snapshot.agent("Search Orchestrator").expect("registered");
    assert_eq!(added.status, AgentStatus::Started);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_payload_is_dropped_and_stream_stays_open() {
    let transport = ScriptedTransport::new(vec![held(vec![
        "{not json".to_string(),
        json!({"type": "mystery"}).to_string(),
        json!({"type": "heartbeat"}).to_string(),
    ])]);
    let mut session = SearchSession::new(
        &fast_config(),
        transport.clone(),
        Arc::new(RecordingInitiator::default()),
    );
    session.start(SearchRequest::new("q")).expect("start");
    let opened = step(&mut session).await;
    assert_eq!(opened.state, SessionState::Streaming);

    for _ in 0..3 {
        let snapshot = step(&mut session).await;
        assert_eq!(snapshot.state, SessionState::Streaming);
        assert_eq!(snapshot.agents, opened.agents);
        assert!(snapshot.timeline.is_empty());
    }
    assert!(session.is_streaming_connection_live());
    assert_eq!(transport.opens(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn application_error_fails_without_reconnect() {
    let transport = ScriptedTransport::new(vec![held(vec![
        progress("Web Search Specialist", "started", "Searching the web"),
        json!({"type": "error", "error": "Multi-agent search failed: quota exceeded"}).to_string(),
        final_result("too late"),
    ])]);
    let mut session = SearchSession::new(
        &fast_config(),
        transport.clone(),
        Arc::new(RecordingInitiator::default()),
    );
    session.start(SearchRequest::new("q")).expect("start");
    let snapshot = settle(&mut session).await;

    assert_eq!(snapshot.state, SessionState::Failed);
    assert_eq!(
        snapshot.error_message.as_deref(),
        Some("Multi-agent search failed: quota exceeded")
    );
    assert!(snapshot.final_result.is_none());
    let last = snapshot.timeline.last().expect("error entry");
    assert_eq!(last.kind, TimelineKind::Error);
    assert!(last.important);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.opens(), 1);
    assert!(session.next_event().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_reconnects_fail_the_session() {
    let transport = ScriptedTransport::new(Vec::new());
    let initiator = Arc::new(RecordingInitiator::default());
    let mut session = SearchSession::new(&fast_config(), transport.clone(), initiator.clone());
    session.start(SearchRequest::new("q")).expect("start");
    let snapshot = settle(&mut session).await;

    assert_eq!(snapshot.state, SessionState::Failed);
    let message = snapshot.error_message.as_deref().expect("error message");
    assert!(message.contains("5 reconnect attempts"), "{message}");
    assert_eq!(transport.opens(), 6);
    assert!(initiator.calls().is_empty());

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.opens(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_replays_into_timeline_but_not_board() {
    let started = progress("RAG Specialist", "started", "Searching knowledge base");
    let transport = ScriptedTransport::new(vec![
        Attempt::Refuse,
        Attempt::Deliver {
            payloads: vec![started.clone()],
            hold: false,
        },
        held(vec![started, final_result("Answer")]),
    ]);
    let initiator = Arc::new(RecordingInitiator::default());
    let mut session = SearchSession::new(&fast_config(), transport.clone(), initiator.clone());
    let session_id = session.start(SearchRequest::new("q")).expect("start");
    let snapshot = settle(&mut session).await;

    assert_eq!(snapshot.state, SessionState::Completed);
    assert_eq!(transport.opens(), 3);
    assert!(transport
        .session_ids
        .lock()
        .expect("session ids")
        .iter()
        .all(|id| *id == session_id));
    assert_eq!(initiator.calls().len(), 1);

    let started_entries = snapshot
        .timeline
        .iter()
        .filter(|entry| entry.kind == TimelineKind::Status(AgentStatus::Started))
        .count();
    assert_eq!(started_entries, 2);
    let rag = snapshot.agent("RAG Specialist").expect("rag");
    assert_eq!(rag.status, AgentStatus::Started);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_is_idempotent_and_final() {
    let transport = ScriptedTransport::new(vec![held(Vec::new())]);
    let mut session = SearchSession::new(
        &fast_config(),
        transport,
        Arc::new(RecordingInitiator::default()),
    );
    session.start(SearchRequest::new("q")).expect("start");
    step(&mut session).await;

    session.close();
    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.next_event().await.is_none());
    assert_eq!(
        session.start(SearchRequest::new("again")),
        Err(SessionError::Closed)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_cancels_pending_reconnect() {
    let transport = ScriptedTransport::new(Vec::new());
    let config = ClientConfig {
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(40),
            max_attempts: 5,
        },
        ..ClientConfig::default()
    };
    let mut session = SearchSession::new(
        &config,
        transport.clone(),
        Arc::new(RecordingInitiator::default()),
    );
    session.start(SearchRequest::new("q")).expect("start");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.opens(), 1);

    session.close();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(transport.opens(), 1);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_after_completion_resets_everything() {
    let transport = ScriptedTransport::new(vec![
        held(vec![
            progress("Answer Generator", "completed", "done"),
            final_result("first"),
        ]),
        held(Vec::new()),
    ]);
    let initiator = Arc::new(RecordingInitiator::default());
    let mut session = SearchSession::new(&fast_config(), transport, initiator.clone());
    let first_id = session.start(SearchRequest::new("one")).expect("start");
    settle(&mut session).await;

    let mut request = SearchRequest::new("two");
    request.session_id = Some("caller-chosen".to_string());
    let second_id = session.start(request).expect("restart");
    assert_ne!(first_id, second_id);
    assert_eq!(second_id, "caller-chosen");

    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, SessionState::Connecting);
    assert!(snapshot.final_result.is_none());
    assert!(snapshot.timeline.is_empty());
    assert!(snapshot.error_message.is_none());
    assert!(snapshot
        .agents
        .iter()
        .all(|record| record.status == AgentStatus::Waiting));

    step(&mut session).await;
    let calls = initiator.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].0, "caller-chosen");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_is_rejected_while_running() {
    let transport = ScriptedTransport::new(vec![held(Vec::new())]);
    let mut session = SearchSession::new(
        &fast_config(),
        transport,
        Arc::new(RecordingInitiator::default()),
    );
    session.start(SearchRequest::new("q")).expect("start");
    assert_eq!(
        session.start(SearchRequest::new("again")),
        Err(SessionError::AlreadyRunning(SessionState::Connecting))
    );
    step(&mut session).await;
    assert_eq!(
        session.start(SearchRequest::new("again")),
        Err(SessionError::AlreadyRunning(SessionState::Streaming))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initiation_failure_fails_the_session() {
    let transport = ScriptedTransport::new(vec![held(Vec::new())]);
    let initiator = RecordingInitiator::failing(InitiationError::Status {
        status: 500,
        body: "backend down".to_string(),
    });
    let mut session = SearchSession::new(&fast_config(), transport, initiator);
    session.start(SearchRequest::new("q")).expect("start");
    let snapshot = settle(&mut session).await;

    assert_eq!(snapshot.state, SessionState::Failed);
    let message = snapshot.error_message.as_deref().expect("message");
    assert!(message.starts_with("task initiation failed"), "{message}");
    assert!(message.contains("backend down"), "{message}");
    assert!(!session.is_streaming_connection_live());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribers_see_published_snapshots() {
    let transport = ScriptedTransport::new(vec![held(vec![final_result("Answer")])]);
    let mut session = SearchSession::new(
        &fast_config(),
        transport,
        Arc::new(RecordingInitiator::default()),
    );
    let mut updates = session.subscribe();
    assert_eq!(updates.borrow_and_update().state, SessionState::Idle);

    session.start(SearchRequest::new("q")).expect("start");
    assert!(updates.has_changed().expect("sender alive"));
    assert_eq!(updates.borrow_and_update().state, SessionState::Connecting);

    settle(&mut session).await;
    assert!(updates.has_changed().expect("sender alive"));
    let latest = updates.borrow_and_update().clone();
    assert_eq!(latest.state, SessionState::Completed);
    assert_eq!(latest.important_timeline().count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_apply_while_initiation_is_in_flight() {
    let transport = ScriptedTransport::new(vec![held(vec![
        progress("RAG Specialist", "started", "Searching knowledge base"),
        json!({"type": "error", "error": "boom"}).to_string(),
    ])]);
    let initiator = SlowInitiator::new(Duration::from_secs(3));
    let mut session = SearchSession::new(&fast_config(), transport, initiator.clone());
    session.start(SearchRequest::new("q")).expect("start");

    step(&mut session).await;
    let snapshot = tokio::time::timeout(Duration::from_secs(1), session.next_event())
        .await
        .expect("progress applied before initiation returns")
        .expect("connection live");
    assert_eq!(snapshot.state, SessionState::Streaming);
    assert_eq!(
        snapshot.agent("RAG Specialist").map(|record| record.status.clone()),
        Some(AgentStatus::Started)
    );
    assert_eq!(initiator.started(), 1);
    assert_eq!(initiator.finished(), 0);

    let snapshot = tokio::time::timeout(Duration::from_secs(1), session.next_event())
        .await
        .expect("error applied before initiation returns")
        .expect("connection live");
    assert_eq!(snapshot.state, SessionState::Failed);
    assert_eq!(snapshot.error_message.as_deref(), Some("boom"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_next_event_does_not_lose_initiation() {
    let transport = ScriptedTransport::new(vec![held(Vec::new())]);
    let initiator = SlowInitiator::new(Duration::from_millis(60));
    let mut session = SearchSession::new(&fast_config(), transport, initiator.clone());
    session.start(SearchRequest::new("q")).expect("start");

    for _ in 0..30 {
        let _ = tokio::time::timeout(Duration::from_millis(10), session.next_event()).await;
    }

    assert_eq!(initiator.started(), 1);
    assert_eq!(initiator.finished(), 1);
    assert_eq!(session.state(), SessionState::Streaming);
    assert!(session.error_message().is_none());
}
