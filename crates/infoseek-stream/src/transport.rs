use crate::config::ClientConfig;
use futures_util::{
    future::{self, BoxFuture},
    stream::{self, BoxStream},
    FutureExt, Stream, StreamExt,
};
use infoseek_core::sse_frame::{DecodeReport, SseFrame, SseFrameDecoder};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::Serialize;
use std::{collections::VecDeque, fmt, pin::Pin};
use thiserror::Error;
use tracing::warn;

/// Raw event payloads in delivery order. The stream ending or yielding an
/// error is a transport-level close.
pub type PayloadStream = BoxStream<'static, Result<String, TransportError>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("stream request failed: {0}")]
    Request(String),
    #[error("stream endpoint returned status {0}")]
    Status(u16),
    #[error("stream read failed: {0}")]
    Read(String),
    #[error("stream closed by server")]
    Closed,
}

pub trait EventTransport: Send + Sync + 'static {
    fn open(&self, session_id: &str) -> BoxFuture<'static, Result<PayloadStream, TransportError>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitiationError {
    #[error("initiation request failed: {0}")]
    Request(String),
    #[error("initiation endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub session_id: Option<String>,
    pub include_web: bool,
    pub include_rag: bool,
    pub max_results: u32,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            session_id: None,
            include_web: true,
            include_rag: true,
            max_results: 10,
        }
    }
}

#[derive(Serialize)]
struct InitiationBody<'a> {
    query: &'a str,
    session_id: &'a str,
    include_web: bool,
    include_rag: bool,
    max_results: u32,
}

/// Kicks off backend work. Only the acknowledgement matters; results arrive
/// on the stream.
pub trait TaskInitiator: Send + Sync + 'static {
    fn initiate(
        &self,
        session_id: &str,
        request: &SearchRequest,
    ) -> BoxFuture<'static, Result<(), InitiationError>>;
}

#[derive(Clone)]
pub struct HttpSseTransport {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpSseTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }
}

impl EventTransport for HttpSseTransport {
    fn open(&self, session_id: &str) -> BoxFuture<'static, Result<PayloadStream, TransportError>> {
        let url = match self.config.stream_url(session_id) {
            Ok(url) => url,
            Err(err) => {
                let err = TransportError::Request(format!("invalid stream url: {err}"));
                return future::ready(Err(err)).boxed();
            }
        };
        let request = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        let max_frame_bytes = self.config.max_frame_bytes;
        async move {
            let response = request
                .send()
                .await
                .map_err(|err| TransportError::Request(err.to_string()))?;
            if !response.status().is_success() {
                return Err(TransportError::Status(response.status().as_u16()));
            }
            Ok(sse_payloads(response.bytes_stream(), max_frame_bytes))
        }
        .boxed()
    }
}

struct SseReader<S> {
    bytes: Pin<Box<S>>,
    decoder: SseFrameDecoder,
    ready: VecDeque<String>,
    done: bool,
}

impl<S> SseReader<S> {
    fn absorb(&mut self, report: DecodeReport<SseFrame>) {
        for err in report.errors {
            warn!(event = "stream_frame_error", error = %err);
        }
        for frame in report.frames {
            if frame.data.trim().is_empty() {
                continue;
            }
            self.ready.push_back(frame.data);
        }
    }
}

/// Turns a `text/event-stream` byte stream into event payloads.
pub fn sse_payloads<S, B, E>(bytes: S, max_frame_bytes: usize) -> PayloadStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let reader = SseReader {
        bytes: Box::pin(bytes),
        decoder: SseFrameDecoder::new(max_frame_bytes),
        ready: VecDeque::new(),
        done: false,
    };
    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(payload) = reader.ready.pop_front() {
                return Some((Ok(payload), reader));
            }
            if reader.done {
                return None;
            }
            match reader.bytes.next().await {
                Some(Ok(chunk)) => {
                    let report = reader.decoder.push_chunk(chunk.as_ref());
                    reader.absorb(report);
                }
                Some(Err(err)) => {
                    reader.done = true;
                    return Some((Err(TransportError::Read(err.to_string())), reader));
                }
                None => {
                    let report = reader.decoder.finish();
                    reader.absorb(report);
                    reader.done = true;
                }
            }
        }
    })
    .boxed()
}

#[derive(Clone)]
pub struct HttpTaskInitiator {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpTaskInitiator {
    pub fn new(config: &ClientConfig) -> Result<Self, InitiationError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| InitiationError::Request(err.to_string()))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }
}

impl TaskInitiator for HttpTaskInitiator {
    fn initiate(
        &self,
        session_id: &str,
        request: &SearchRequest,
    ) -> BoxFuture<'static, Result<(), InitiationError>> {
        let body = InitiationBody {
            query: &request.query,
            session_id,
            include_web: request.include_web,
            include_rag: request.include_rag,
            max_results: request.max_results,
        };
        let url = match self.config.initiate_url() {
            Ok(url) => url,
            Err(err) => {
                let err = InitiationError::Request(format!("invalid initiation url: {err}"));
                return future::ready(Err(err)).boxed();
            }
        };
        let request = self.client.post(url).json(&body);
        async move {
            let response = request
                .send()
                .await
                .map_err(|err| InitiationError::Request(err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(InitiationError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(())
        }
        .boxed()
    }
}
