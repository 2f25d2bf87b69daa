//! Per-connection state machine.
//!
//! `Accepted -> Parsing -> Authenticating -> CheckingDestination -> Connecting -> Relaying -> Closed`,
//! with `Denied` and `Failed` reachable from every stage before relaying.
//! Each connection ends in exactly one outcome and one access record, also
//! when its task is aborted at shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::auth::CredentialStore;
use crate::config::{Config, LogFormat};
use crate::context::{DenyReason, FailureReason, Outcome, RequestContext};
use crate::error::{ParseError, ProxyError};
use crate::logging::{AccessLog, LogAccessLog};
use crate::parser::{RequestMode, RequestParser};
use crate::prebuffered::Prebuffered;
use crate::relay::TunnelRelay;
use crate::response::{self, ResponseBuilder, TUNNEL_ESTABLISHED};
use crate::safeguards::{DomainPolicy, SafeguardChecker};
use crate::stats::ProxyStats;
use crate::upstream::{Connector, TcpConnector};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub header_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_header_size: usize,
    pub auth_realm: String,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            header_timeout: config.header_timeout(),
            idle_timeout: config.idle_timeout(),
            max_header_size: config.max_header_size(),
            auth_realm: config.auth_realm().to_string(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct ProxyEngine {
    settings: EngineSettings,
    safeguards: Arc<SafeguardChecker>,
    connector: Arc<dyn Connector>,
    access_log: Arc<dyn AccessLog>,
    stats: Arc<ProxyStats>,
    relay: TunnelRelay,
}

impl ProxyEngine {
    pub fn new(
        settings: EngineSettings,
        safeguards: Arc<SafeguardChecker>,
        connector: Arc<dyn Connector>,
        access_log: Arc<dyn AccessLog>,
        stats: Arc<ProxyStats>,
    ) -> Self {
        let relay = TunnelRelay::new(settings.idle_timeout, settings.max_header_size);
        Self {
            settings,
            safeguards,
            connector,
            access_log,
            stats,
            relay,
        }
    }

    /// Loads credentials and domain lists named by `config` and wires the
    /// TCP connector and a log-backed access log writing `access_format`.
    pub fn from_config(
        config: &Config,
        access_format: LogFormat,
        stats: Arc<ProxyStats>,
    ) -> Result<Self, ProxyError> {
        let credentials = config
            .auth_file
            .as_ref()
            .map(CredentialStore::load)
            .transpose()?
            .map(Arc::new);
        let policy = DomainPolicy::from_files(config.allow_list.as_deref(), config.block_list.as_deref())?;
        let safeguards = SafeguardChecker::new(credentials, Arc::new(policy))
            .with_allow_private(config.allow_private.unwrap_or(false));
        debug!("Safeguards: {safeguards:?}");

        Ok(Self::new(
            EngineSettings::from_config(config),
            Arc::new(safeguards),
            Arc::new(TcpConnector::new(config.connect_timeout())),
            Arc::new(LogAccessLog::new(access_format)),
            stats,
        ))
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    /// Runs one client connection to completion and emits its access record.
    pub async fn handle<S>(&self, stream: S, client_addr: SocketAddr) -> RequestContext
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut flight = InFlight::new(self, RequestContext::new(client_addr));
        debug!("[{}] Accepted connection from {}", flight.id(), client_addr);

        let outcome = self.drive(stream, &mut flight).await;
        flight.finish(outcome)
    }

    /// Finalizes `ctx` and hands it to the stats and the access log.
    fn complete(&self, ctx: RequestContext, outcome: Outcome) -> RequestContext {
        let ctx = match ctx.finalize(outcome) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("[{}] {}", e.context.id(), e);
                *e.context
            }
        };

        self.stats.record(&ctx);
        self.access_log.record(&ctx.to_record());
        ctx
    }

    /// Walks the stages and returns the outcome to finalize.
    async fn drive<S>(&self, stream: S, flight: &mut InFlight<'_>) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (read_half, mut client_w) = tokio::io::split(stream);
        let mut client_r = Prebuffered::new(read_half, self.settings.max_header_size);

        // Parsing
        let header_timeout = self.settings.header_timeout;
        let parsed = tokio::time::timeout(header_timeout, RequestParser::read_request(&mut client_r))
            .await
            .unwrap_or(Err(ParseError::Timeout(header_timeout)));
        let request = match parsed {
            Ok(request) => request,
            Err(e) => {
                debug!("[{}] Bad request: {}", flight.id(), e);
                if let Some(status) = e.status_code() {
                    reply(&mut client_w, &ResponseBuilder::error(status, &e.to_string())).await;
                }
                return Outcome::Failed(failure_for(&e));
            }
        };
        flight.update(|ctx| {
            ctx.with_request(
                request.method.clone(),
                request.target.host.clone(),
                request.target.port,
            )
        });
        debug!("[{}] {} {}", flight.id(), request.method, request.target);

        // Authenticating
        match self.safeguards.authenticate(request.proxy_authorization()) {
            Ok(Some(identity)) => flight.update(|ctx| ctx.with_user(identity.user)),
            Ok(None) => {}
            Err(failure) => {
                debug!("[{}] Authentication failed: {}", flight.id(), failure);
                reply(&mut client_w, &ResponseBuilder::auth_required(&self.settings.auth_realm)).await;
                return Outcome::Denied(DenyReason::AuthFailure);
            }
        }

        // CheckingDestination
        let verdict = self.safeguards.check_destination(&request.target.host);
        if !verdict.allowed {
            let reason = verdict.reason.unwrap_or(DenyReason::BlockedDomain);
            debug!("[{}] Denied {}: {}", flight.id(), request.target, reason);
            reply(&mut client_w, &ResponseBuilder::forbidden(&reason.to_string())).await;
            return Outcome::Denied(reason);
        }

        // Connecting
        let connected = tokio::select! {
            result = self.connector.connect(&request.target.host, request.target.port) => result,
            _ = client_gone(&mut client_r) => {
                debug!("[{}] Client left while connecting to {}", flight.id(), request.target);
                return Outcome::Failed(FailureReason::ClientClosed);
            }
        };
        let upstream = match connected {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("[{}] Upstream unreachable: {}", flight.id(), e);
                reply(&mut client_w, &ResponseBuilder::error(e.status_code(), &e.to_string())).await;
                return Outcome::Failed(FailureReason::UpstreamUnreachable(e.kind().to_string()));
            }
        };

        // Relaying
        flight.relaying = true;
        let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);
        let report = match &request.mode {
            RequestMode::Tunnel => {
                if let Err(e) = response::send(&mut client_w, TUNNEL_ESTABLISHED).await {
                    debug!("[{}] Client write failed: {}", flight.id(), e);
                    return Outcome::Forwarded { truncated: true };
                }
                self.relay
                    .tunnel(&mut client_r, &mut client_w, &mut upstream_r, &mut upstream_w)
                    .await
            }
            RequestMode::Plain { path } => {
                self.relay
                    .exchange(
                        &request,
                        path,
                        &mut client_r,
                        &mut client_w,
                        &mut upstream_r,
                        &mut upstream_w,
                    )
                    .await
            }
        };
        debug!("[{}] Relay ended: {:?}", flight.id(), report.end);

        flight.update(|ctx| ctx.with_traffic(report.traffic()));
        Outcome::Forwarded {
            truncated: report.truncated(),
        }
    }
}

/// Holds the context of a connection that has not been recorded yet.
///
/// Dropping it unfinished, which happens when the connection task is
/// aborted, still records the connection: `Forwarded(truncated)` once the
/// relay started, `Failed(Cancelled)` before that. Byte counts of an aborted
/// relay are not known and stay at zero.
struct InFlight<'a> {
    engine: &'a ProxyEngine,
    ctx: RequestContext,
    relaying: bool,
    done: bool,
}

impl<'a> InFlight<'a> {
    fn new(engine: &'a ProxyEngine, ctx: RequestContext) -> Self {
        Self {
            engine,
            ctx,
            relaying: false,
            done: false,
        }
    }

    fn id(&self) -> String {
        self.ctx.id()
    }

    fn update(&mut self, f: impl FnOnce(RequestContext) -> RequestContext) {
        self.ctx = f(self.ctx.clone());
    }

    fn finish(mut self, outcome: Outcome) -> RequestContext {
        self.done = true;
        self.engine.complete(self.ctx.clone(), outcome)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let outcome = if self.relaying {
            Outcome::Forwarded { truncated: true }
        } else {
            Outcome::Failed(FailureReason::Cancelled)
        };
        debug!("[{}] Connection aborted, recording {}", self.ctx.id(), outcome);
        self.engine.complete(self.ctx.clone(), outcome);
    }
}

fn failure_for(error: &ParseError) -> FailureReason {
    match error {
        ParseError::MalformedRequest(_) => FailureReason::MalformedRequest,
        ParseError::UnsupportedMethod(_) => FailureReason::UnsupportedMethod,
        ParseError::HeaderTooLarge { .. } => FailureReason::HeaderTooLarge,
        ParseError::Timeout(_) => FailureReason::HeaderTimeout,
        ParseError::IncompleteHeaders | ParseError::Io(_) => FailureReason::IncompleteHeaders,
    }
}

/// Best-effort response followed by a close of the write side.
async fn reply<W: AsyncWrite + Unpin>(writer: &mut W, response: &[u8]) {
    if response::send(writer, response).await.is_ok() {
        let _ = writer.shutdown().await;
    }
}

/// Resolves once reading from the client fails. End of stream only means the
/// client half-closed after its request, so the connect keeps going; bytes it
/// sends meanwhile stay buffered.
async fn client_gone<R: AsyncRead + Unpin>(reader: &mut Prebuffered<R>) {
    loop {
        if reader.is_full() {
            std::future::pending::<()>().await;
        }
        match reader.buffer_more().await {
            Err(_) => return,
            Ok(0) => std::future::pending::<()>().await,
            Ok(_) => {}
        }
    }
}
