//! Read-side buffer that lets the parser look at a message head and then hand
//! the stream on without losing bytes the peer already sent past it.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};

const INITIAL_CAPACITY: usize = 4 * 1024;

/// Bounded buffer in front of an `AsyncRead`. Reads through [`AsyncRead`]
/// drain the buffer before touching the inner reader.
#[derive(Debug)]
pub struct Prebuffered<R> {
    inner: R,
    buf: BytesMut,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> Prebuffered<R> {
    pub fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_len)),
            max_len,
        }
    }

    /// Unconsumed buffered bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Drops `n` bytes from the front of the buffer.
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    /// Reads more data into the buffer. Returns 0 on EOF or when the buffer is full.
    /// Cancel safe.
    pub async fn buffer_more(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        if max == 0 {
            return Ok(0);
        }
        (&mut self.inner)
            .take(max as u64)
            .read_buf(&mut self.buf)
            .await
    }

    /// Buffers until a CRLF-terminated line is available and takes it, terminator included.
    pub async fn read_line(&mut self) -> io::Result<Bytes> {
        let mut searched = 0;
        loop {
            if let Some(pos) = self.buf[searched..].windows(2).position(|w| w == b"\r\n") {
                return Ok(self.buf.split_to(searched + pos + 2).freeze());
            }
            searched = self.buf.len().saturating_sub(1);
            if self.is_full() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "line exceeds buffer limit",
                ));
            }
            if self.buffer_more().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Prebuffered<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !out.has_remaining_mut() {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining_mut());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn buffered_bytes_are_read_first() {
        let mut p = Prebuffered::new(Cursor::new(&b"hello world"[..]), 5);
        p.buffer_more().await.unwrap();
        assert_eq!(p.buffer(), b"hello");
        assert!(p.is_full());
        assert_eq!(p.buffer_more().await.unwrap(), 0);

        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn discard_then_read_rest() {
        let mut p = Prebuffered::new(Cursor::new(&b"HEAD\r\n\r\nbody"[..]), 64);
        p.buffer_more().await.unwrap();
        p.discard(8);
        assert_eq!(p.buffer(), b"body");
        p.discard(100);
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn read_line_spans_multiple_reads() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut p = Prebuffered::new(rx, 64);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            tx.write_all(b"1a\r").await.unwrap();
            tokio::task::yield_now().await;
            tx.write_all(b"\nrest").await.unwrap();
        });
        let line = p.read_line().await.unwrap();
        assert_eq!(&line[..], b"1a\r\n");
        writer.await.unwrap();
        let mut rest = [0u8; 4];
        p.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"rest");
    }

    #[tokio::test]
    async fn read_line_eof_and_limit() {
        let mut p = Prebuffered::new(Cursor::new(&b"no terminator"[..]), 64);
        let err = p.read_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let mut p = Prebuffered::new(Cursor::new(&b"0123456789\r\n"[..]), 4);
        let err = p.read_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
