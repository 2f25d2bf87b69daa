//! Request head parsing for the forward proxy.
//!
//! The parser reads the request line and header block through a
//! [`Prebuffered`] reader, bounded by its maximum length, and decides once
//! whether the connection is a CONNECT tunnel or a plain HTTP exchange.

use std::fmt;
use std::net::Ipv4Addr;

use tokio::io::AsyncRead;

use crate::context::Method;
use crate::error::ParseError;
use crate::prebuffered::Prebuffered;

/// Headers beyond this count are treated as an oversized header block.
pub const MAX_HEADERS: usize = 100;

const DEFAULT_HTTP_PORT: u16 = 80;

/// Case-insensitive header list preserving order and duplicates as sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, Vec<u8>)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name` that is valid UTF-8.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name)
            .find_map(|value| std::str::from_utf8(value).ok())
            .map(str::trim)
    }

    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a [u8]> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_all(name).next().is_some()
    }

    /// Comma-separated tokens across every occurrence of `name`, lowercased.
    pub fn tokens(&self, name: &str) -> Vec<String> {
        self.get_all(name)
            .filter_map(|value| std::str::from_utf8(value).ok())
            .flat_map(|value| value.split(','))
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host without brackets for IPv6 literals.
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// How the engine must treat the connection after checks pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestMode {
    /// CONNECT: answer 200 and relay opaque bytes.
    Tunnel,
    /// Plain HTTP: forward the request upstream with an origin-form target.
    Plain { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: Method,
    pub mode: RequestMode,
    pub target: Target,
    /// Minor HTTP version, 0 or 1.
    pub version: u8,
    pub headers: HeaderList,
}

impl ParsedRequest {
    pub fn proxy_authorization(&self) -> Option<&str> {
        self.headers.get("proxy-authorization")
    }

    pub fn is_tunnel(&self) -> bool {
        matches!(self.mode, RequestMode::Tunnel)
    }
}

pub struct RequestParser;

impl RequestParser {
    /// Reads and parses the request head, removing it from `reader`.
    /// Any bytes after the header terminator stay buffered.
    pub async fn read_request<R>(reader: &mut Prebuffered<R>) -> Result<ParsedRequest, ParseError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some((len, request)) = Self::parse(reader.buffer())? {
                reader.discard(len);
                return Ok(request);
            }
            if reader.is_full() {
                return Err(ParseError::HeaderTooLarge {
                    limit: reader.max_len(),
                });
            }
            if reader.buffer_more().await? == 0 {
                return Err(ParseError::IncompleteHeaders);
            }
        }
    }

    /// Parses a complete head from `buf`, returning its length. `None` when more bytes are needed.
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, ParsedRequest)>, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(buf) {
            Ok(httparse::Status::Partial) => return Ok(None),
            Ok(httparse::Status::Complete(len)) => len,
            Err(httparse::Error::TooManyHeaders) => {
                return Err(ParseError::HeaderTooLarge { limit: buf.len() });
            }
            Err(e) => return Err(ParseError::MalformedRequest(e.to_string())),
        };

        let raw_method = req
            .method
            .ok_or_else(|| ParseError::MalformedRequest("missing method".to_string()))?;
        let method = Method::parse(raw_method)
            .ok_or_else(|| ParseError::UnsupportedMethod(raw_method.to_string()))?;
        let path = req
            .path
            .ok_or_else(|| ParseError::MalformedRequest("missing request target".to_string()))?;
        let version = req
            .version
            .ok_or_else(|| ParseError::MalformedRequest("missing HTTP version".to_string()))?;

        let mut header_list = HeaderList::new();
        for header in req.headers.iter() {
            header_list.push(header.name, header.value);
        }

        let (mode, target) = match method {
            Method::Connect => (RequestMode::Tunnel, parse_authority(path, None)?),
            _ => parse_plain_target(path, &header_list)?,
        };

        Ok(Some((
            len,
            ParsedRequest {
                method,
                mode,
                target,
                version,
                headers: header_list,
            },
        )))
    }
}

fn parse_plain_target(path: &str, headers: &HeaderList) -> Result<(RequestMode, Target), ParseError> {
    if path.starts_with('/') || path == "*" {
        let host = headers.get("host").ok_or_else(|| {
            ParseError::MalformedRequest("origin-form request without Host header".to_string())
        })?;
        let target = parse_authority(host, Some(DEFAULT_HTTP_PORT))?;
        return Ok((
            RequestMode::Plain {
                path: path.to_string(),
            },
            target,
        ));
    }

    let url = url::Url::parse(path)
        .map_err(|e| ParseError::MalformedRequest(format!("invalid request target: {e}")))?;
    if url.scheme() != "http" {
        return Err(ParseError::MalformedRequest(format!(
            "unsupported scheme {:?} in request target",
            url.scheme()
        )));
    }
    let host = match url.host() {
        Some(url::Host::Domain(domain)) => domain.to_string(),
        Some(url::Host::Ipv4(ip)) => ip.to_string(),
        Some(url::Host::Ipv6(ip)) => ip.to_string(),
        None => {
            return Err(ParseError::MalformedRequest(
                "absolute URL without host".to_string(),
            ));
        }
    };
    let port = url.port_or_known_default().unwrap_or(DEFAULT_HTTP_PORT);

    Ok((
        RequestMode::Plain {
            path: origin_form(path),
        },
        Target { host, port },
    ))
}

/// Path and query of an absolute-form target, taken from the raw text so
/// the forwarded request line keeps the client's encoding.
fn origin_form(absolute: &str) -> String {
    let after_scheme = absolute
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(absolute);
    let after_scheme = after_scheme.split('#').next().unwrap_or(after_scheme);
    match after_scheme.find(['/', '?']) {
        Some(index) if after_scheme[index..].starts_with('?') => {
            format!("/{}", &after_scheme[index..])
        }
        Some(index) => after_scheme[index..].to_string(),
        None => "/".to_string(),
    }
}

/// Parses `host:port`, `[v6]:port`, or a bare host when `default_port` is given.
fn parse_authority(authority: &str, default_port: Option<u16>) -> Result<Target, ParseError> {
    let malformed = || ParseError::MalformedRequest(format!("invalid authority {authority:?}"));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(malformed)?;
        host.parse::<std::net::Ipv6Addr>().map_err(|_| malformed())?;
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if after.is_empty() => (host, None),
            None => return Err(malformed()),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty()
        || host
            .bytes()
            .any(|b| b.is_ascii_whitespace() || matches!(b, b'/' | b'@' | b'?' | b'#' | b'[' | b']'))
        || (host.contains(':') && host.parse::<std::net::Ipv6Addr>().is_err())
    {
        return Err(malformed());
    }

    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(malformed)?,
        None => default_port.ok_or_else(malformed)?,
    };

    let host = host.to_ascii_lowercase();
    // The system resolver reads numeric shorthands as IPv4 literals; pin them
    // to the dotted-quad form so later checks see the real address.
    let host = if is_numeric_host(&host) {
        parse_ipv4_loose(&host).ok_or_else(malformed)?.to_string()
    } else {
        host
    };

    Ok(Target { host, port })
}

/// Every dot-separated label starts with a digit and holds only hex digits or `x`.
fn is_numeric_host(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    !host.is_empty()
        && host.split('.').all(|label| {
            label.starts_with(|c: char| c.is_ascii_digit())
                && label.chars().all(|c| c.is_ascii_hexdigit() || c == 'x' || c == 'X')
        })
}

/// Parses the IPv4 spellings `inet_aton` accepts: one to four dot-separated
/// parts in decimal, octal (leading `0`) or hex (`0x`), the last part filling
/// the remaining bytes. `127.1`, `2130706433` and `0x7f000001` are all 127.0.0.1.
pub fn parse_ipv4_loose(host: &str) -> Option<Ipv4Addr> {
    let host = host.strip_suffix('.').unwrap_or(host);
    let parts = host
        .split('.')
        .map(parse_ipv4_part)
        .collect::<Option<Vec<u32>>>()?;
    if parts.is_empty() || parts.len() > 4 {
        return None;
    }

    let (last, leading) = parts.split_last()?;
    let mut addr = 0u32;
    for (i, part) in leading.iter().enumerate() {
        if *part > 0xff {
            return None;
        }
        addr |= part << (24 - 8 * i);
    }
    let remaining_bits = 32 - 8 * leading.len();
    if remaining_bits < 32 && (*last >> remaining_bits) != 0 {
        return None;
    }
    Some(Ipv4Addr::from(addr | last))
}

fn parse_ipv4_part(part: &str) -> Option<u32> {
    let (digits, radix) = if let Some(hex) = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X")) {
        (hex, 16)
    } else if part.len() > 1 && part.starts_with('0') {
        (&part[1..], 8)
    } else {
        (part, 10)
    };
    if digits.is_empty() {
        // `0x` alone reads as zero; an empty label does not.
        return (radix == 16).then_some(0);
    }
    if !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u32::from_str_radix(digits, radix).ok()
}
