//! TCP listener and accept loop.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::engine::ProxyEngine;
use crate::error::ProxyError;

/// Back-off after a failed accept, e.g. when out of file descriptors.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

pub struct ProxyServer {
    listener: TcpListener,
    engine: Arc<ProxyEngine>,
    limit: Arc<Semaphore>,
}

impl ProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        engine: Arc<ProxyEngine>,
        max_connections: usize,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        Ok(Self::from_listener(listener, engine, max_connections))
    }

    pub fn from_listener(listener: TcpListener, engine: Arc<ProxyEngine>, max_connections: usize) -> Self {
        Self {
            listener,
            engine,
            limit: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until `shutdown` resolves. Connections still in flight are
    /// aborted when this returns; each leaves an access record behind.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!("🕳️  Wormhole proxy listening on {}", addr);

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            // Reap finished connections so the set does not grow unbounded.
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!("Connection task panicked: {}", e);
                    }
                }
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = &mut shutdown => break,
            };

            let (stream, client_addr) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };
            let _ = stream.set_nodelay(true);

            let engine = Arc::clone(&self.engine);
            let active = engine.stats().connection_opened();
            tasks.spawn(async move {
                let _permit = permit;
                let _active = active;
                engine.handle(stream, client_addr).await;
            });
        }

        info!("🛑 Stopped accepting connections");
        let in_flight = tasks.len();
        if in_flight > 0 {
            debug!("Aborting {} in-flight connection(s)", in_flight);
        }
        tasks.shutdown().await;
        info!("📊 {}", self.engine.stats().snapshot());
        Ok(())
    }
}
