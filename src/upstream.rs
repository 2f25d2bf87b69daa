//! Outbound TCP connections to origin servers.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, lookup_host};
use tokio::task::JoinSet;

use crate::error::UpstreamError;

pub trait UpstreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> UpstreamIo for T {}

/// Bidirectional byte stream to the origin. Owned by the relay once connected.
pub type UpstreamStream = Box<dyn UpstreamIo>;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<UpstreamStream, UpstreamError>;
}

/// Head start each resolved address gets before the next one is tried in parallel.
pub const CONNECT_STAGGER: Duration = Duration::from_millis(250);

/// Resolves with the system resolver and races the resolved addresses,
/// all within one connect timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn open(&self, host: &str, port: u16) -> Result<TcpStream, UpstreamError> {
        let target = format!("{host}:{port}");
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|source| UpstreamError::Resolve {
                target: target.clone(),
                source,
            })?
            .collect();
        trace!("{target} resolved to {addrs:?}");
        connect_any(addrs, target, CONNECT_STAGGER).await
    }
}

type Attempts = JoinSet<(SocketAddr, std::io::Result<TcpStream>)>;

fn start(attempts: &mut Attempts, addr: SocketAddr) {
    attempts.spawn(async move { (addr, TcpStream::connect(addr).await) });
}

/// Starts one connect per address in order, each `stagger` after the previous
/// one or as soon as it fails. The first stream to connect wins and the other
/// attempts are aborted. If every attempt fails, the last error is returned.
async fn connect_any(addrs: Vec<SocketAddr>, target: String, stagger: Duration) -> Result<TcpStream, UpstreamError> {
    let mut pending = addrs.into_iter();
    let mut attempts = Attempts::new();
    let mut last_error = UpstreamError::NoAddresses { target };

    if let Some(addr) = pending.next() {
        start(&mut attempts, addr);
    }

    while !attempts.is_empty() {
        let joined = tokio::select! {
            joined = attempts.join_next() => joined,
            _ = tokio::time::sleep(stagger), if !pending.as_slice().is_empty() => {
                if let Some(addr) = pending.next() {
                    trace!("Racing {addr}");
                    start(&mut attempts, addr);
                }
                continue;
            }
        };
        match joined {
            Some(Ok((_, Ok(stream)))) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Some(Ok((addr, Err(e)))) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                debug!("Connection to {addr} refused");
                last_error = UpstreamError::Refused { addr };
            }
            Some(Ok((addr, Err(source)))) => {
                debug!("Connection to {addr} failed: {source}");
                last_error = UpstreamError::Connect { addr, source };
            }
            Some(Err(e)) => debug!("Connect attempt aborted: {e}"),
            None => break,
        }
        if let Some(addr) = pending.next() {
            start(&mut attempts, addr);
        }
    }
    Err(last_error)
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<UpstreamStream, UpstreamError> {
        match tokio::time::timeout(self.connect_timeout, self.open(host, port)).await {
            Ok(Ok(stream)) => Ok(Box::new(stream)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(UpstreamError::Timeout {
                target: format!("{host}:{port}"),
                after: self.connect_timeout,
            }),
        }
    }
}
