//! Responses the proxy writes itself, as raw HTTP/1.1 bytes.

use http::StatusCode;
use tokio::io::{self, AsyncWrite, AsyncWriteExt};

/// Sent to the client once a CONNECT tunnel is established.
pub const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Status line, `Connection: close` and a short plain-text body.
    pub fn error(status: StatusCode, message: &str) -> Vec<u8> {
        Self::with_headers(status, &[], message)
    }

    /// 407 with a Basic challenge so the client can retry with credentials.
    pub fn auth_required(realm: &str) -> Vec<u8> {
        let challenge = format!("Basic realm=\"{}\"", realm.replace('"', "'"));
        Self::with_headers(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            &[("Proxy-Authenticate", challenge.as_str())],
            "Proxy authentication required",
        )
    }

    pub fn forbidden(reason: &str) -> Vec<u8> {
        Self::error(StatusCode::FORBIDDEN, reason)
    }

    pub fn bad_gateway() -> Vec<u8> {
        Self::error(StatusCode::BAD_GATEWAY, "Bad Gateway")
    }

    pub fn with_headers(status: StatusCode, headers: &[(&str, &str)], message: &str) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        for (name, value) in headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        out.push_str(&format!("Content-Length: {}\r\n", message.len() + 2));
        out.push_str("Connection: close\r\n\r\n");
        out.push_str(message);
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Writes and flushes a prepared response.
pub async fn send<W: AsyncWrite + Unpin>(writer: &mut W, response: &[u8]) -> io::Result<()> {
    writer.write_all(response).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_challenge_carries_realm() {
        let raw = String::from_utf8(ResponseBuilder::auth_required("Wormhole Proxy")).unwrap();
        assert!(raw.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
        assert!(raw.contains("Proxy-Authenticate: Basic realm=\"Wormhole Proxy\"\r\n"));
        assert!(raw.contains("Connection: close\r\n"));
    }

    #[test]
    fn content_length_matches_body() {
        let raw = String::from_utf8(ResponseBuilder::forbidden("BlockedDomain")).unwrap();
        assert!(raw.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        let (head, body) = raw.split_once("\r\n\r\n").unwrap();
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
    }
}
