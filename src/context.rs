//! Per-connection audit state.
//!
//! A [`RequestContext`] is created as soon as a connection is accepted and is
//! updated by replacement as the engine learns more about the request. Its
//! [`Outcome`] moves from `Pending` to a terminal value exactly once.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ContextError;

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// Request method as seen on the request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Connect,
    Get,
    Post,
    Head,
    Put,
    Delete,
    Other(String),
}

impl Method {
    /// Maps a request-line verb onto a method the proxy relays.
    /// Returns `None` for verbs it refuses to handle.
    pub fn parse(raw: &str) -> Option<Method> {
        match raw {
            "CONNECT" => Some(Method::Connect),
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "HEAD" => Some(Method::Head),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "PATCH" | "OPTIONS" | "TRACE" => Some(Method::Other(raw.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Connect => "CONNECT",
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Other(raw) => raw,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    AuthFailure,
    BlockedDomain,
    PrivateNetworkTarget,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DenyReason::AuthFailure => "AuthFailure",
            DenyReason::BlockedDomain => "BlockedDomain",
            DenyReason::PrivateNetworkTarget => "PrivateNetworkTarget",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    MalformedRequest,
    UnsupportedMethod,
    IncompleteHeaders,
    HeaderTooLarge,
    HeaderTimeout,
    /// Carries the connector's short failure tag (`timeout`, `dns`, `refused`, `connect`).
    UpstreamUnreachable(String),
    ClientClosed,
    /// The connection task was aborted, e.g. at shutdown, before relaying began.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureReason::MalformedRequest => "MalformedRequest",
            FailureReason::UnsupportedMethod => "UnsupportedMethod",
            FailureReason::IncompleteHeaders => "IncompleteHeaders",
            FailureReason::HeaderTooLarge => "HeaderTooLarge",
            FailureReason::HeaderTimeout => "HeaderTimeout",
            FailureReason::UpstreamUnreachable(_) => "UpstreamUnreachable",
            FailureReason::ClientClosed => "ClientClosed",
            FailureReason::Cancelled => "Cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    /// Bytes were relayed. `truncated` marks an idle timeout or an I/O error mid-relay.
    Forwarded { truncated: bool },
    Denied(DenyReason),
    Failed(FailureReason),
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pending => f.write_str("Pending"),
            Outcome::Forwarded { truncated: false } => f.write_str("Forwarded"),
            Outcome::Forwarded { truncated: true } => f.write_str("Forwarded(truncated)"),
            Outcome::Denied(reason) => write!(f, "Denied({reason})"),
            Outcome::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// Bytes moved by the relay plus the upstream status line, if one was seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub upstream_status: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    connection_id: u32,
    client_addr: SocketAddr,
    requested_at: DateTime<Utc>,
    started: Instant,
    method: Option<Method>,
    target: Option<(String, u16)>,
    user: Option<String>,
    traffic: Traffic,
    outcome: Outcome,
}

impl RequestContext {
    pub fn new(client_addr: SocketAddr) -> Self {
        Self {
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff,
            client_addr,
            requested_at: Utc::now(),
            started: Instant::now(),
            method: None,
            target: None,
            user: None,
            traffic: Traffic::default(),
            outcome: Outcome::Pending,
        }
    }

    pub fn with_request(self, method: Method, host: impl Into<String>, port: u16) -> Self {
        Self {
            method: Some(method),
            target: Some((host.into(), port)),
            ..self
        }
    }

    pub fn with_user(self, user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..self
        }
    }

    pub fn with_traffic(self, traffic: Traffic) -> Self {
        Self { traffic, ..self }
    }

    /// Sets the terminal outcome. Fails if the outcome is already terminal
    /// or if `outcome` itself is `Pending`.
    pub fn finalize(self, outcome: Outcome) -> Result<Self, ContextError> {
        if self.outcome.is_terminal() || !outcome.is_terminal() {
            return Err(ContextError {
                context: Box::new(self),
                attempted: outcome,
            });
        }
        Ok(Self { outcome, ..self })
    }

    /// Six hex digits, used to correlate log lines of one connection.
    pub fn id(&self) -> String {
        format!("{:06x}", self.connection_id)
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn target_host(&self) -> Option<&str> {
        self.target.as_ref().map(|(host, _)| host.as_str())
    }

    pub fn target_port(&self) -> Option<u16> {
        self.target.as_ref().map(|(_, port)| *port)
    }

    pub fn authenticated_user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn traffic(&self) -> Traffic {
        self.traffic
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn to_record(&self) -> AccessRecord {
        AccessRecord {
            connection_id: self.id(),
            client_address: self.client_addr.to_string(),
            requested_at: self.requested_at,
            method: self.method.as_ref().map(|m| m.to_string()),
            target_host: self.target_host().map(str::to_string),
            target_port: self.target_port(),
            authenticated_user: self.user.clone(),
            outcome: self.outcome.to_string(),
            detail: match &self.outcome {
                Outcome::Failed(FailureReason::UpstreamUnreachable(kind)) => Some(kind.clone()),
                _ => None,
            },
            upstream_status: self.traffic.upstream_status,
            bytes_up: self.traffic.bytes_up,
            bytes_down: self.traffic.bytes_down,
            duration_ms: self.elapsed_ms(),
        }
    }
}

/// One access-log entry per completed connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRecord {
    pub connection_id: String,
    pub client_address: String,
    pub requested_at: DateTime<Utc>,
    pub method: Option<String>,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub authenticated_user: Option<String>,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub upstream_status: Option<u16>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub duration_ms: u64,
}

impl fmt::Display for AccessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} {}:{} user={} outcome={}",
            self.connection_id,
            self.client_address,
            self.method.as_deref().unwrap_or("-"),
            self.target_host.as_deref().unwrap_or("-"),
            self.target_port.map_or_else(|| "-".to_string(), |p| p.to_string()),
            self.authenticated_user.as_deref().unwrap_or("-"),
            self.outcome,
        )?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        if let Some(status) = self.upstream_status {
            write!(f, " status={status}")?;
        }
        write!(
            f,
            " up={} down={} {}ms",
            self.bytes_up, self.bytes_down, self.duration_ms
        )
    }
}
