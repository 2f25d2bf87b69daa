//! Byte relays between a client and its upstream connection.
//!
//! Tunnel mode copies opaque bytes in both directions concurrently with
//! half-close propagation. Proxy mode forwards one rewritten HTTP/1.x request
//! and its response, using message framing to know when the exchange ends.
//! Both modes stop when no byte has moved in either direction for the idle
//! timeout.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use http::StatusCode;
use log::{debug, trace};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::context::{Method, Traffic};
use crate::parser::{HeaderList, MAX_HEADERS, ParsedRequest};
use crate::prebuffered::Prebuffered;
use crate::response::{self, ResponseBuilder};

const BUFFER_SIZE: usize = 16 * 1024;

/// Headers that only apply to a single hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-authenticate",
    "te",
    "trailer",
    "upgrade",
];

/// Framing headers a `Connection` token is not allowed to remove.
const FRAMING: &[&str] = &["host", "content-length", "transfer-encoding"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    /// Both sides finished cleanly.
    Completed,
    IdleTimeout,
    /// An I/O or framing error cut the relay short.
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub upstream_status: Option<u16>,
    pub end: RelayEnd,
}

impl RelayReport {
    pub fn truncated(&self) -> bool {
        self.end != RelayEnd::Completed
    }

    pub fn traffic(&self) -> Traffic {
        Traffic {
            bytes_up: self.bytes_up,
            bytes_down: self.bytes_down,
            upstream_status: self.upstream_status,
        }
    }
}

/// Last time any byte moved, shared by both copy directions and the watchdog.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

async fn idle_watchdog(activity: &Activity, limit: Duration) {
    loop {
        let idle = activity.idle_for();
        if idle >= limit {
            return;
        }
        tokio::time::sleep(limit - idle).await;
    }
}

#[derive(Debug, Clone)]
pub struct TunnelRelay {
    idle_timeout: Duration,
    max_header_size: usize,
}

impl TunnelRelay {
    pub fn new(idle_timeout: Duration, max_header_size: usize) -> Self {
        Self {
            idle_timeout,
            max_header_size,
        }
    }

    /// Relays raw bytes until both directions reach EOF, one fails, or the
    /// connection goes idle. Each direction half-closes its destination when
    /// its source ends.
    pub async fn tunnel<CR, CW, UR, UW>(
        &self,
        client_r: &mut CR,
        client_w: &mut CW,
        upstream_r: &mut UR,
        upstream_w: &mut UW,
    ) -> RelayReport
    where
        CR: AsyncRead + Unpin,
        CW: AsyncWrite + Unpin,
        UR: AsyncRead + Unpin,
        UW: AsyncWrite + Unpin,
    {
        let activity = Activity::new();
        let up = AtomicU64::new(0);
        let down = AtomicU64::new(0);

        let end = {
            let upload = pump(client_r, upstream_w, &up, &activity);
            let download = pump(upstream_r, client_w, &down, &activity);
            tokio::select! {
                (upload, download) = async { tokio::join!(upload, download) } => {
                    match (upload, download) {
                        (Ok(()), Ok(())) => RelayEnd::Completed,
                        (Err(e), _) | (_, Err(e)) => RelayEnd::Aborted(e.to_string()),
                    }
                }
                _ = idle_watchdog(&activity, self.idle_timeout) => RelayEnd::IdleTimeout,
            }
        };

        if end != RelayEnd::Completed {
            let _ = client_w.shutdown().await;
            let _ = upstream_w.shutdown().await;
        }

        RelayReport {
            bytes_up: up.into_inner(),
            bytes_down: down.into_inner(),
            upstream_status: None,
            end,
        }
    }

    /// Forwards one plain HTTP request and relays its response. The client
    /// gets `Connection: close`, so the exchange is the last one on the connection.
    pub async fn exchange<CR, CW, UR, UW>(
        &self,
        request: &ParsedRequest,
        path: &str,
        client_r: &mut Prebuffered<CR>,
        client_w: &mut CW,
        upstream_r: &mut UR,
        upstream_w: &mut UW,
    ) -> RelayReport
    where
        CR: AsyncRead + Unpin,
        CW: AsyncWrite + Unpin,
        UR: AsyncRead + Unpin,
        UW: AsyncWrite + Unpin,
    {
        let activity = Activity::new();
        let up = AtomicU64::new(0);
        let down = AtomicU64::new(0);
        let status = AtomicU32::new(0);
        let mut upstream_r = Prebuffered::new(upstream_r, self.max_header_size);

        let end = {
            let upload = async {
                let head = render_request_head(request, path);
                upstream_w.write_all(&head).await?;
                up.fetch_add(head.len() as u64, Ordering::Relaxed);
                activity.touch();
                let framing = request_framing(&request.headers)?;
                copy_body(client_r, &mut *upstream_w, framing, &up, &activity).await?;
                upstream_w.flush().await
            };

            let download = async {
                loop {
                    let head = read_response_head(&mut upstream_r).await?;
                    status.store(u32::from(head.status), Ordering::Relaxed);
                    let interim = (100..200).contains(&head.status) && head.status != 101;
                    let rendered = head.render(!interim);
                    client_w.write_all(&rendered).await?;
                    down.fetch_add(rendered.len() as u64, Ordering::Relaxed);
                    activity.touch();
                    if interim {
                        client_w.flush().await?;
                        continue;
                    }
                    let framing = response_framing(&request.method, &head)?;
                    copy_body(&mut upstream_r, &mut *client_w, framing, &down, &activity).await?;
                    return client_w.flush().await;
                }
            };

            tokio::pin!(upload);
            tokio::pin!(download);
            let both = async {
                let mut upload_result: Option<io::Result<()>> = None;
                loop {
                    tokio::select! {
                        res = &mut upload, if upload_result.is_none() => upload_result = Some(res),
                        res = &mut download => return (upload_result, res),
                    }
                }
            };

            tokio::select! {
                (upload_result, download_result) = both => match (upload_result, download_result) {
                    (_, Err(e)) => RelayEnd::Aborted(format!("response: {e}")),
                    (Some(Err(e)), Ok(())) => RelayEnd::Aborted(format!("request: {e}")),
                    _ => RelayEnd::Completed,
                },
                _ = idle_watchdog(&activity, self.idle_timeout) => RelayEnd::IdleTimeout,
            }
        };

        let upstream_status = match status.into_inner() {
            0 => None,
            code => u16::try_from(code).ok(),
        };

        if upstream_status.is_none() && end != RelayEnd::Completed {
            let reply = match end {
                RelayEnd::IdleTimeout => {
                    ResponseBuilder::error(StatusCode::GATEWAY_TIMEOUT, "Upstream response timed out")
                }
                _ => ResponseBuilder::bad_gateway(),
            };
            if response::send(client_w, &reply).await.is_ok() {
                down.fetch_add(reply.len() as u64, Ordering::Relaxed);
            }
        }
        if end != RelayEnd::Completed {
            debug!("Exchange with {} ended early: {:?}", request.target, end);
        }
        let _ = client_w.shutdown().await;
        let _ = upstream_w.shutdown().await;

        RelayReport {
            bytes_up: up.into_inner(),
            bytes_down: down.into_inner(),
            upstream_status,
            end,
        }
    }
}

/// One copy direction. Shuts down the writer when the reader ends or fails.
async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64, activity: &Activity) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let result = async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), io::Error>(());
            }
            activity.touch();
            writer.write_all(&buf[..n]).await?;
            writer.flush().await?;
            counter.fetch_add(n as u64, Ordering::Relaxed);
            activity.touch();
        }
    }
    .await;
    let _ = writer.shutdown().await;
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

fn is_chunked(headers: &HeaderList) -> Option<bool> {
    let codings = headers.tokens("transfer-encoding");
    (!codings.is_empty()).then(|| codings.last().is_some_and(|c| c == "chunked"))
}

fn content_length(headers: &HeaderList) -> io::Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_all("content-length") {
        let parsed = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| invalid("invalid Content-Length"))?;
        if length.is_some_and(|l| l != parsed) {
            return Err(invalid("conflicting Content-Length values"));
        }
        length = Some(parsed);
    }
    Ok(length)
}

fn request_framing(headers: &HeaderList) -> io::Result<BodyFraming> {
    match is_chunked(headers) {
        Some(true) => return Ok(BodyFraming::Chunked),
        Some(false) => return Err(invalid("request Transfer-Encoding without chunked")),
        None => {}
    }
    Ok(match content_length(headers)? {
        Some(0) | None => BodyFraming::Empty,
        Some(n) => BodyFraming::Length(n),
    })
}

fn response_framing(method: &Method, head: &ResponseHead) -> io::Result<BodyFraming> {
    if *method == Method::Head
        || (head.status < 200 && head.status != 101)
        || head.status == 204
        || head.status == 304
    {
        return Ok(BodyFraming::Empty);
    }
    if head.status == 101 {
        return Ok(BodyFraming::UntilClose);
    }
    match is_chunked(&head.headers) {
        Some(true) => return Ok(BodyFraming::Chunked),
        Some(false) => return Ok(BodyFraming::UntilClose),
        None => {}
    }
    Ok(match content_length(&head.headers)? {
        Some(0) => BodyFraming::Empty,
        Some(n) => BodyFraming::Length(n),
        None => BodyFraming::UntilClose,
    })
}

async fn copy_body<R, W>(
    reader: &mut Prebuffered<R>,
    writer: &mut W,
    framing: BodyFraming,
    counter: &AtomicU64,
    activity: &Activity,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    trace!("Copying body with {framing:?} framing");
    match framing {
        BodyFraming::Empty => Ok(()),
        BodyFraming::Length(n) => copy_exact(reader, writer, n, counter, activity).await,
        BodyFraming::Chunked => copy_chunked(reader, writer, counter, activity).await,
        BodyFraming::UntilClose => copy_to_end(reader, writer, counter, activity).await,
    }
}

async fn copy_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    counter: &AtomicU64,
    activity: &Activity,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;
    let mut buf = vec![0u8; BUFFER_SIZE.min(len as usize)];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
        remaining -= n as u64;
    }
    Ok(())
}

async fn copy_to_end<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64, activity: &Activity) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

/// Relays a chunked body verbatim, parsing chunk sizes to find its end.
async fn copy_chunked<R, W>(
    reader: &mut Prebuffered<R>,
    writer: &mut W,
    counter: &AtomicU64,
    activity: &Activity,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let size_line = reader.read_line().await?;
        let size = parse_chunk_size(&size_line)?;
        writer.write_all(&size_line).await?;
        counter.fetch_add(size_line.len() as u64, Ordering::Relaxed);
        activity.touch();

        if size == 0 {
            // Trailer section ends with an empty line.
            loop {
                let line = reader.read_line().await?;
                writer.write_all(&line).await?;
                counter.fetch_add(line.len() as u64, Ordering::Relaxed);
                if &line[..] == b"\r\n" {
                    return Ok(());
                }
            }
        }

        copy_exact(reader, writer, size, counter, activity).await?;
        let crlf = reader.read_line().await?;
        if &crlf[..] != b"\r\n" {
            return Err(invalid("missing CRLF after chunk data"));
        }
        writer.write_all(&crlf).await?;
        counter.fetch_add(2, Ordering::Relaxed);
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let line = std::str::from_utf8(line).map_err(|_| invalid("non-ASCII chunk size"))?;
    let size = line.trim_end_matches("\r\n").split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16).map_err(|_| invalid("invalid chunk size"))
}

/// Names of headers that must not cross the proxy for this message.
fn dropped_headers(headers: &HeaderList) -> Vec<String> {
    let mut dropped: Vec<String> = HOP_BY_HOP.iter().map(|h| h.to_string()).collect();
    // Transfer-Encoding wins over Content-Length.
    if headers.contains("transfer-encoding") {
        dropped.push("content-length".to_string());
    }
    for token in headers
        .tokens("connection")
        .into_iter()
        .chain(headers.tokens("proxy-connection"))
    {
        if !FRAMING.contains(&token.as_str()) {
            dropped.push(token);
        }
    }
    dropped
}

fn push_headers(out: &mut Vec<u8>, headers: &HeaderList) {
    let dropped = dropped_headers(headers);
    for (name, value) in headers.iter() {
        if dropped.iter().any(|d| d.eq_ignore_ascii_case(name)) {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
}

/// Request head for the origin: origin-form target, hop-by-hop headers
/// removed, `Host` guaranteed and `Connection: close` appended.
pub fn render_request_head(request: &ParsedRequest, path: &str) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.{}\r\n", request.method, path, request.version).into_bytes();
    push_headers(&mut out, &request.headers);
    if !request.headers.contains("host") {
        let host = if request.target.host.contains(':') {
            format!("[{}]", request.target.host)
        } else {
            request.target.host.clone()
        };
        if request.target.port == 80 {
            out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
        } else {
            out.extend_from_slice(format!("Host: {host}:{}\r\n", request.target.port).as_bytes());
        }
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out
}

#[derive(Debug)]
struct ResponseHead {
    version: u8,
    status: u16,
    reason: String,
    headers: HeaderList,
}

impl ResponseHead {
    fn parse(buf: &[u8]) -> io::Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        let len = match res.parse(buf) {
            Ok(httparse::Status::Partial) => return Ok(None),
            Ok(httparse::Status::Complete(len)) => len,
            Err(e) => return Err(invalid(&format!("invalid upstream response: {e}"))),
        };
        let mut header_list = HeaderList::new();
        for header in res.headers.iter() {
            header_list.push(header.name, header.value);
        }
        Ok(Some((
            len,
            Self {
                version: res.version.unwrap_or(1),
                status: res.code.ok_or_else(|| invalid("missing status code"))?,
                reason: res.reason.unwrap_or("").to_string(),
                headers: header_list,
            },
        )))
    }

    /// Final responses carry `Connection: close`; interim ones are passed as-is.
    fn render(&self, close: bool) -> Vec<u8> {
        let mut out = format!("HTTP/1.{} {} {}\r\n", self.version, self.status, self.reason).into_bytes();
        push_headers(&mut out, &self.headers);
        if close {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

async fn read_response_head<R: AsyncRead + Unpin>(reader: &mut Prebuffered<R>) -> io::Result<ResponseHead> {
    loop {
        if let Some((len, head)) = ResponseHead::parse(reader.buffer())? {
            reader.discard(len);
            return Ok(head);
        }
        if reader.is_full() {
            return Err(invalid("upstream response header block too large"));
        }
        if reader.buffer_more().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed before sending a response",
            ));
        }
    }
}
