use std::{io, time::Duration};

/// Rejected configuration. Fatal to `Client::new`; no client is produced.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config: need bind address")]
    MissingBindAddr,
    #[error("config: need remote server address")]
    MissingRemoteAddr,
    #[error("config: invalid {field} {value:?}: {reason}")]
    InvalidAddr {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("config: timeout must be positive, got {0:?}")]
    InvalidTimeout(Duration),
    #[error("config: mux max stream must be between 1 and {max}, got {got}")]
    MuxMaxStreamOutOfRange { got: usize, max: usize },
    #[error("config: fallback dns server must be an IP address (optionally with port), got {0:?}")]
    InvalidFallbackDns(String),
    #[error("config: invalid server name {0:?}")]
    InvalidServerName(String),
    #[error("config: plugin option {key:?}: {reason}")]
    PluginOption { key: String, reason: String },
    #[error("config: tls setup: {0}")]
    Tls(#[from] rustls::Error),
}

/// Failure to establish a remote-side byte stream.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("{stage} timed out after {}", humantime::format_duration(*.timeout))]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },
    #[error("tls handshake: {0}")]
    Tls(#[source] io::Error),
    #[error("websocket upgrade: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("socket setup: {0}")]
    Socket(#[source] io::Error),
    #[error("mux session: {0}")]
    Session(#[from] SessionError),
}

/// Failure opening a logical stream on an existing session.
///
/// `TooManyStreams` is a normal "try the next session" signal, not a defect.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session has too many streams")]
    TooManyStreams,
    #[error("session is closed")]
    Closed,
    #[error("open stream: {0}")]
    Open(String),
}

/// The accept loop ended. Returned from `Client::start`.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("listen {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("accept: {0}")]
    Accept(#[source] io::Error),
    #[error("listener closed")]
    Closed,
    #[error("client is already serving on {0}")]
    AlreadyStarted(std::net::SocketAddr),
}

/// Direction of a relay half, named from the local client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{direction}: {source}")]
    Io {
        direction: Direction,
        #[source]
        source: io::Error,
    },
    #[error("idle for {}", humantime::format_duration(*.0))]
    Idle(Duration),
}

/// Failure of one forwarding task. Logged, never propagated past the task.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("connect to remote: {0}")]
    Transport(#[from] TransportError),
    #[error("relay: {0}")]
    Relay(#[from] RelayError),
}

impl TransportError {
    pub(crate) fn timeout(stage: &'static str, timeout: Duration) -> Self {
        TransportError::Timeout { stage, timeout }
    }
}
