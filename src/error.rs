use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to connect to exchange at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Outbound channel closed")]
    OutboundClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Capacity probe error: {0}")]
    Probe(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
