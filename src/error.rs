use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::context::Outcome;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure to read a usable request head from the client.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("connection closed before end of request headers")]
    IncompleteHeaders,

    #[error("request header block exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("request headers not received within {0:?}")]
    Timeout(Duration),

    #[error("client read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// Status to send back, if the client is still worth answering.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            ParseError::MalformedRequest(_) | ParseError::IncompleteHeaders => {
                Some(StatusCode::BAD_REQUEST)
            }
            ParseError::UnsupportedMethod(_) => Some(StatusCode::METHOD_NOT_ALLOWED),
            ParseError::HeaderTooLarge { .. } => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            ParseError::Timeout(_) => Some(StatusCode::REQUEST_TIMEOUT),
            ParseError::Io(_) => None,
        }
    }
}

/// Rejected or missing proxy credentials. Always answered with a 407 challenge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("missing Proxy-Authorization header")]
    MissingHeader,

    #[error("unsupported authorization scheme: {0}")]
    UnsupportedScheme(String),

    #[error("malformed credentials: {0}")]
    Malformed(&'static str),

    #[error("invalid credentials for user {0:?}")]
    InvalidCredentials(String),
}

/// Failure to open the upstream connection.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("connect to {target} timed out after {after:?}")]
    Timeout { target: String, after: Duration },

    #[error("failed to resolve {target}: {source}")]
    Resolve {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no addresses found for {target}")]
    NoAddresses { target: String },

    #[error("connection refused by {addr}")]
    Refused { addr: SocketAddr },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

impl UpstreamError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            UpstreamError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short tag used in access records.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Timeout { .. } => "timeout",
            UpstreamError::Resolve { .. } | UpstreamError::NoAddresses { .. } => "dns",
            UpstreamError::Refused { .. } => "refused",
            UpstreamError::Connect { .. } => "connect",
        }
    }
}

/// Attempt to set a request outcome more than once, or back to `Pending`.
/// Hands the untouched context back to the caller.
#[derive(Error, Debug)]
#[error("cannot move request outcome from {} to {attempted}", .context.outcome())]
pub struct ContextError {
    pub context: Box<crate::context::RequestContext>,
    pub attempted: Outcome,
}
