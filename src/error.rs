use crate::types::{StreamKind, TradingPair};
use thiserror::Error;

/// Categorizes errors for recovery decisions.
///
/// Each layer (keep-alive stream, shard job, supervisor) looks at the kind
/// rather than the concrete variant to decide whether to retry locally,
/// escalate, or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, resets, failed connects. Retried with backoff by the shard job.
    Transient,
    /// Malformed or venue-reported payloads. Logged, never fatal.
    Protocol,
    /// A keep-alive stream was consumed twice. Not retried.
    Reentrancy,
    /// Anything that should tear the whole stream kind down and rebuild it.
    Fatal,
    /// Shutdown was requested.
    ShuttingDown,
}

/// Errors that can occur in ws-market-ingest
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No frame arrived within the idle-read deadline
    #[error("No message from {kind} stream within {elapsed_ms}ms (pairs: {pairs:?})")]
    Timeout {
        kind: StreamKind,
        pairs: Vec<TradingPair>,
        elapsed_ms: u64,
    },

    /// The remote end closed the stream
    #[error("{0} stream ended by remote")]
    StreamEnded(StreamKind),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP request returned a non-success status
    #[error("HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// Payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// The venue reported an error payload
    #[error("Venue error: {0}")]
    Venue(String),

    /// A keep-alive stream was consumed while already in use (or after it was spent)
    #[error("Keep-alive stream already in use ({0})")]
    Reentrancy(&'static str),

    /// Trading pair catalog unavailable
    #[error("Trading pair catalog error: {0}")]
    Catalog(String),

    /// Request signing failed
    #[error("Auth error: {0}")]
    Auth(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Shutdown was requested
    #[error("Ingestion is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_)
            | Error::ConnectionFailed(_)
            | Error::Timeout { .. }
            | Error::StreamEnded(_)
            | Error::Http(_)
            | Error::HttpStatus { .. } => ErrorKind::Transient,
            Error::Decode(_) | Error::Venue(_) => ErrorKind::Protocol,
            Error::Reentrancy(_) => ErrorKind::Reentrancy,
            Error::Catalog(_) | Error::Auth(_) | Error::Config(_) => ErrorKind::Fatal,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
        }
    }

    /// Whether this error is the idle-read timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::ConnectionFailed("refused".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            Error::Timeout {
                kind: StreamKind::Depth,
                pairs: vec![],
                elapsed_ms: 15_000
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_eq!(Error::Decode("bad".into()).kind(), ErrorKind::Protocol);
        assert_eq!(Error::Venue("rejected".into()).kind(), ErrorKind::Protocol);
        assert_eq!(Error::Reentrancy("active").kind(), ErrorKind::Reentrancy);
        assert_eq!(Error::Catalog("down".into()).kind(), ErrorKind::Fatal);
        assert_eq!(Error::ShuttingDown.kind(), ErrorKind::ShuttingDown);
    }

    #[test]
    fn test_timeout_message_names_kind_and_pairs() {
        let err = Error::Timeout {
            kind: StreamKind::Trade,
            pairs: vec![TradingPair::from("BTC-USDT")],
            elapsed_ms: 15_000,
        };
        let text = err.to_string();
        assert!(text.contains("trade"));
        assert!(text.contains("BTC-USDT"));
        assert!(err.is_timeout());
    }
}
