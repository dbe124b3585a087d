use crate::transport::{EventTransport, TransportError};
use futures_util::StreamExt;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

const EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Attempt counter and current delay for one connection worker.
#[derive(Clone, Debug)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempts: u32,
    delay: Duration,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            delay: policy.initial_delay.min(policy.max_delay),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn on_open(&mut self) {
        self.attempts = 0;
        self.delay = self.policy.initial_delay.min(self.policy.max_delay);
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        let current = self.delay;
        self.delay = next_backoff(current, self.policy.max_delay);
        Some(current)
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current.saturating_mul(2);
    if next > max {
        max
    } else {
        next
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("stream unavailable after {attempts} reconnect attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open,
    Message(String),
    Failed(ConnectionError),
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    events: mpsc::Receiver<ConnectionEvent>,
}

/// Session-scoped event stream with automatic reconnect. The worker task owns
/// the transport handle and the reconnect timer; `disconnect` cancels both.
pub struct StreamConnection<T> {
    transport: Arc<T>,
    session_id: String,
    policy: ReconnectPolicy,
    worker: Option<Worker>,
}

impl<T: EventTransport> StreamConnection<T> {
    pub fn new(transport: Arc<T>, session_id: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            session_id: session_id.into(),
            policy,
            worker: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| !worker.handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawns the stream worker. No-op while one is already running.
    pub fn connect(&mut self) {
        if self.is_active() {
            return;
        }
        let (event_tx, events) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(stream_loop(
            self.transport.clone(),
            self.session_id.clone(),
            self.policy,
            event_tx,
            shutdown_rx,
        ));
        self.worker = Some(Worker {
            shutdown,
            handle,
            events,
        });
    }

    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        match self.worker.as_mut() {
            Some(worker) => worker.events.recv().await,
            None => None,
        }
    }

    pub fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(true);
            worker.handle.abort();
            info!(event = "stream_disconnect", session_id = %self.session_id);
        }
    }
}

impl<T> Drop for StreamConnection<T> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(true);
            worker.handle.abort();
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn stream_loop<T: EventTransport>(
    transport: Arc<T>,
    session_id: String,
    policy: ReconnectPolicy,
    tx: mpsc::Sender<ConnectionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reconnect = ReconnectState::new(policy);

    loop {
        let opened = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return,
            opened = transport.open(&session_id) => opened,
        };

        let failure = match opened {
            Ok(mut payloads) => {
                reconnect.on_open();
                info!(event = "stream_open", session_id = %session_id);
                if tx.send(ConnectionEvent::Open).await.is_err() {
                    return;
                }
                loop {
                    tokio::select! {
                        _ = wait_for_shutdown(&mut shutdown) => return,
                        next = payloads.next() => match next {
                            Some(Ok(payload)) => {
                                if tx.send(ConnectionEvent::Message(payload)).await.is_err() {
                                    return;
                                }
                            }
                            Some(Err(err)) => break err,
                            None => break TransportError::Closed,
                        },
                    }
                }
            }
            Err(err) => err,
        };

        warn!(
            event = "stream_transport_error",
            session_id = %session_id,
            error = %failure
        );

        let Some(delay) = reconnect.next_delay() else {
            warn!(
                event = "stream_retries_exhausted",
                session_id = %session_id,
                attempts = reconnect.attempts()
            );
            let _ = tx
                .send(ConnectionEvent::Failed(ConnectionError::ExhaustedRetries {
                    attempts: reconnect.attempts(),
                    last_error: failure.to_string(),
                }))
                .await;
            return;
        };

        debug!(
            event = "stream_reconnect_scheduled",
            session_id = %session_id,
            attempt = reconnect.attempts(),
            delay_ms = delay.as_millis() as u64
        );
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
