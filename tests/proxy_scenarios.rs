//! End-to-end proxy behaviour over loopback TCP.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use wormhole::auth::CredentialStore;
use wormhole::context::AccessRecord;
use wormhole::error::UpstreamError;
use wormhole::logging::AccessLog;
use wormhole::safeguards::{DomainPolicy, SafeguardChecker};
use wormhole::stats::ProxyStats;
use wormhole::upstream::{Connector, TcpConnector, UpstreamStream};
use wormhole::{EngineSettings, ProxyEngine, ProxyServer};

#[derive(Default)]
struct RecordingAccessLog {
    records: Mutex<Vec<AccessRecord>>,
}

impl AccessLog for RecordingAccessLog {
    fn record(&self, record: &AccessRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

impl RecordingAccessLog {
    async fn wait_for(&self, count: usize) -> Vec<AccessRecord> {
        for _ in 0..200 {
            {
                let records = self.records.lock().unwrap();
                if records.len() >= count {
                    return records.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} access record(s)");
    }
}

/// Counts connect attempts before delegating to a real TCP connector.
struct CountingConnector {
    attempts: AtomicUsize,
    inner: TcpConnector,
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<UpstreamStream, UpstreamError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(host, port).await
    }
}

struct TestProxy {
    addr: SocketAddr,
    access_log: Arc<RecordingAccessLog>,
    connector: Arc<CountingConnector>,
    stats: Arc<ProxyStats>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestProxy {
    async fn start(safeguards: SafeguardChecker, idle_timeout: Duration) -> Self {
        let access_log = Arc::new(RecordingAccessLog::default());
        let connector = Arc::new(CountingConnector {
            attempts: AtomicUsize::new(0),
            inner: TcpConnector::new(Duration::from_secs(2)),
        });
        let stats = Arc::new(ProxyStats::new());
        let settings = EngineSettings {
            idle_timeout,
            ..EngineSettings::default()
        };
        let engine = ProxyEngine::new(
            settings,
            Arc::new(safeguards),
            connector.clone(),
            access_log.clone(),
            stats.clone(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = ProxyServer::from_listener(listener, Arc::new(engine), 16);
        let addr = server.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            access_log,
            connector,
            stats,
            shutdown: Some(tx),
            task,
        }
    }

    fn attempts(&self) -> usize {
        self.connector.attempts.load(Ordering::SeqCst)
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.unwrap();
    }
}

fn open_checker() -> SafeguardChecker {
    SafeguardChecker::new(None, Arc::new(DomainPolicy::default())).with_allow_private(true)
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(request).await.unwrap();
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

#[tokio::test]
async fn connect_tunnel_relays_until_close() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let echo = tokio::spawn(async move {
        let (mut socket, _) = origin.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            socket.write_all(&buf[..n]).await.unwrap();
        }
    });

    let proxy = TestProxy::start(open_checker(), Duration::from_secs(5)).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT {origin_addr} HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    assert_eq!(
        read_head(&mut client).await,
        "HTTP/1.1 200 Connection Established\r\n\r\n"
    );

    client.write_all(b"ping through the tunnel").await.unwrap();
    let mut echoed = [0u8; 23];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping through the tunnel");
    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    echo.await.unwrap();

    let records = proxy.access_log.wait_for(1).await;
    assert_eq!(records[0].method.as_deref(), Some("CONNECT"));
    assert_eq!(records[0].target_port, Some(origin_addr.port()));
    assert_eq!(records[0].outcome, "Forwarded");
    assert_eq!(records[0].bytes_up, 23);
    assert_eq!(records[0].bytes_down, 23);
    proxy.stop().await;
}

#[tokio::test]
async fn blocked_domain_is_forbidden_without_upstream_attempt() {
    let policy = DomainPolicy::new(Vec::<&str>::new(), vec!["blocked.example"]);
    let proxy = TestProxy::start(SafeguardChecker::new(None, Arc::new(policy)), Duration::from_secs(5)).await;

    let response = exchange(proxy.addr, b"GET http://blocked.example/ HTTP/1.1\r\nHost: blocked.example\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{response}");

    let response = exchange(proxy.addr, b"CONNECT cdn.blocked.example:443 HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{response}");

    let records = proxy.access_log.wait_for(2).await;
    assert!(records.iter().all(|r| r.outcome == "Denied(BlockedDomain)"));
    assert_eq!(proxy.attempts(), 0);
    proxy.stop().await;
}

#[tokio::test]
async fn missing_credentials_get_challenge() {
    let store = CredentialStore::from_entries([("alice", "wonderland")]);
    let policy = DomainPolicy::new(Vec::<&str>::new(), vec!["blocked.example"]);
    let checker = SafeguardChecker::new(Some(Arc::new(store)), Arc::new(policy));
    let proxy = TestProxy::start(checker, Duration::from_secs(5)).await;

    let response = exchange(proxy.addr, b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").await;
    assert!(
        response.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"),
        "{response}"
    );
    assert!(response.contains("Proxy-Authenticate: Basic realm=\"Wormhole Proxy\"\r\n"));

    // Wrong credentials against a blocked host still fail authentication first.
    let response = exchange(
        proxy.addr,
        b"GET http://blocked.example/ HTTP/1.1\r\nProxy-Authorization: Basic YWxpY2U6d3Jvbmc=\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 407 "), "{response}");

    let records = proxy.access_log.wait_for(2).await;
    assert!(records.iter().all(|r| r.outcome == "Denied(AuthFailure)"));
    assert!(records.iter().all(|r| r.authenticated_user.is_none()));
    assert_eq!(proxy.attempts(), 0);
    proxy.stop().await;
}

#[tokio::test]
async fn refused_upstream_is_bad_gateway() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);

    let proxy = TestProxy::start(open_checker(), Duration::from_secs(5)).await;
    let response = exchange(proxy.addr, format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n").as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{response}");

    let records = proxy.access_log.wait_for(1).await;
    assert_eq!(records[0].outcome, "Failed(UpstreamUnreachable)");
    assert_eq!(records[0].detail.as_deref(), Some("refused"));
    assert_eq!(proxy.attempts(), 1);
    proxy.stop().await;
}

#[tokio::test]
async fn silent_tunnel_is_closed_after_idle_timeout() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut socket, _) = origin.accept().await.unwrap();
        let mut rest = Vec::new();
        // Ends once the proxy tears the tunnel down.
        let _ = socket.read_to_end(&mut rest).await;
        rest
    });

    let proxy = TestProxy::start(open_checker(), Duration::from_millis(200)).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT {origin_addr} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    assert!(read_head(&mut client).await.starts_with("HTTP/1.1 200 "));

    let mut rest = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut rest)).await;
    assert!(closed.is_ok(), "proxy kept the idle tunnel open");
    let upstream_rest = tokio::time::timeout(Duration::from_secs(3), origin_task)
        .await
        .unwrap()
        .unwrap();
    assert!(upstream_rest.is_empty());

    let records = proxy.access_log.wait_for(1).await;
    assert_eq!(records[0].outcome, "Forwarded(truncated)");
    assert_eq!(proxy.stats.snapshot().truncated, 1);
    proxy.stop().await;
}

#[tokio::test]
async fn plain_request_is_rewritten_to_origin_form() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut socket, _) = origin.accept().await.unwrap();
        let head = read_head(&mut socket).await;
        let mut body = [0u8; 5];
        socket.read_exact(&mut body).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\nKeep-Alive: timeout=5\r\n\r\nok")
            .await
            .unwrap();
        (head, body)
    });

    let proxy = TestProxy::start(open_checker(), Duration::from_secs(5)).await;
    let request = format!(
        "POST http://{origin_addr}/submit?x=1 HTTP/1.1\r\nHost: {origin_addr}\r\nProxy-Connection: keep-alive\r\nContent-Length: 5\r\n\r\nhello"
    );
    let response = exchange(proxy.addr, request.as_bytes()).await;
    let (head, body) = origin_task.await.unwrap();

    assert!(head.starts_with("POST /submit?x=1 HTTP/1.1\r\n"), "{head}");
    assert!(!head.to_ascii_lowercase().contains("proxy-connection"));
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(&body, b"hello");

    assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "{response}");
    assert!(!response.contains("Keep-Alive"));
    assert!(response.ends_with("\r\n\r\nok"));

    let records = proxy.access_log.wait_for(1).await;
    assert_eq!(records[0].outcome, "Forwarded");
    assert_eq!(records[0].upstream_status, Some(201));
    proxy.stop().await;
}

#[tokio::test]
async fn shutdown_records_tunnels_still_open() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut socket, _) = origin.accept().await.unwrap();
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
    });

    let proxy = TestProxy::start(open_checker(), Duration::from_secs(30)).await;
    let access_log = proxy.access_log.clone();
    let stats = proxy.stats.clone();
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT {origin_addr} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    assert!(read_head(&mut client).await.starts_with("HTTP/1.1 200 "));

    proxy.stop().await;
    let records = access_log.records.lock().unwrap().clone();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, "Forwarded(truncated)");
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.forwarded, 1);
    assert_eq!(snapshot.active, 0);

    let mut rest = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut rest)).await;
    assert!(closed.is_ok(), "tunnel outlived the proxy");
    tokio::time::timeout(Duration::from_secs(3), origin_task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn numeric_shorthand_loopback_is_forbidden() {
    let proxy = TestProxy::start(
        SafeguardChecker::new(None, Arc::new(DomainPolicy::default())),
        Duration::from_secs(5),
    )
    .await;

    for target in ["127.1:8080", "2130706433:8080", "0x7f000001:8080"] {
        let response = exchange(proxy.addr, format!("CONNECT {target} HTTP/1.1\r\n\r\n").as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{target}: {response}");
    }
    let response = exchange(proxy.addr, b"GET http://2130706433:8080/ HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{response}");

    let records = proxy.access_log.wait_for(4).await;
    assert!(records.iter().all(|r| r.outcome == "Denied(PrivateNetworkTarget)"));
    assert!(records.iter().all(|r| r.target_host.as_deref() == Some("127.0.0.1")));
    assert_eq!(proxy.attempts(), 0);
    proxy.stop().await;
}
