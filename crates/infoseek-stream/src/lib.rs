pub mod config;
pub mod connection;
pub mod session;
pub mod transport;

pub use config::ClientConfig;
pub use connection::{
    ConnectionError, ConnectionEvent, ReconnectPolicy, ReconnectState, StreamConnection,
};
pub use session::{
    SearchSession, SessionError, SessionSnapshot, SessionState, SESSION_TIMELINE_AGENT,
};
pub use transport::{
    sse_payloads, EventTransport, HttpSseTransport, HttpTaskInitiator, InitiationError,
    PayloadStream, SearchRequest, TaskInitiator, TransportError,
};

/// Session wired to the HTTP transport and initiator.
pub type HttpSearchSession = SearchSession<HttpSseTransport, HttpTaskInitiator>;

#[derive(Debug, thiserror::Error)]
pub enum ClientBuildError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Initiation(#[from] InitiationError),
}

pub fn http_session(config: &ClientConfig) -> Result<HttpSearchSession, ClientBuildError> {
    let transport = std::sync::Arc::new(HttpSseTransport::new(config)?);
    let initiator = std::sync::Arc::new(HttpTaskInitiator::new(config)?);
    Ok(SearchSession::new(config, transport, initiator))
}
