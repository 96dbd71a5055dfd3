//! Buffered Chunk Reader
//!
//! A cursor over an incoming byte stream with separate consumed and examined
//! watermarks. `read_chunk` hands back every byte that has not been consumed
//! yet and only suspends when all of them have already been examined;
//! `advance_to` retires a prefix and records how far the caller has looked.
//! Bytes are buffered exactly once: consumed bytes are dropped immediately
//! and examined-but-unconsumed bytes are handed to downstream untouched.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Errors produced by the chunk reader.
#[derive(Debug)]
pub enum CursorError {
    /// The connect deadline elapsed before data arrived.
    DeadlineExceeded,
    /// The underlying stream failed.
    Io(io::Error),
    /// An `advance_to` call tried to move a watermark backwards or past the
    /// buffered data. Indicates a bug in the caller's cursor management.
    InvalidAdvance(&'static str),
}

impl std::fmt::Display for CursorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CursorError::DeadlineExceeded => write!(f, "deadline elapsed while reading"),
            CursorError::Io(e) => write!(f, "read failed: {}", e),
            CursorError::InvalidAdvance(msg) => write!(f, "invalid cursor advance: {}", msg),
        }
    }
}

impl std::error::Error for CursorError {}

impl From<io::Error> for CursorError {
    fn from(e: io::Error) -> Self {
        CursorError::Io(e)
    }
}

/// View of the unconsumed bytes returned by [`ChunkReader::read_chunk`].
#[derive(Debug)]
pub struct Chunk<'a> {
    /// All buffered bytes that have not been consumed.
    pub bytes: &'a [u8],
    /// The far end closed; no more data will ever arrive.
    pub is_completed: bool,
    /// The read was cancelled by the shutdown signal, not the deadline.
    pub is_cancelled: bool,
}

/// Cursor-based reader over an `AsyncRead` stream.
#[derive(Debug)]
pub struct ChunkReader<S> {
    stream: S,
    buf: BytesMut,
    /// Absolute stream position of `buf[0]`; equal to the consumed watermark
    /// since consumed bytes are dropped from the buffer.
    consumed: u64,
    /// Absolute examined watermark, `>= consumed` at all times.
    examined: u64,
    completed: bool,
    cancelled: bool,
}

impl<S> ChunkReader<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(256),
            consumed: 0,
            examined: 0,
            completed: false,
            cancelled: false,
        }
    }

    /// Absolute position of the consumed watermark.
    pub fn consumed_position(&self) -> u64 {
        self.consumed
    }

    /// Absolute position of the examined watermark.
    pub fn examined_position(&self) -> u64 {
        self.examined
    }

    fn unexamined(&self) -> u64 {
        self.consumed + self.buf.len() as u64 - self.examined
    }

    /// Retire bytes up to `consumed` and mark bytes up to `examined` as
    /// looked at. Both positions are absolute and must be monotonic, with
    /// `examined >= consumed`, and neither may point past the buffered data.
    pub fn advance_to(&mut self, consumed: u64, examined: u64) -> Result<(), CursorError> {
        if consumed < self.consumed {
            return Err(CursorError::InvalidAdvance("consumed watermark moved backwards"));
        }
        if examined < self.examined {
            return Err(CursorError::InvalidAdvance("examined watermark moved backwards"));
        }
        if examined < consumed {
            return Err(CursorError::InvalidAdvance("examined watermark behind consumed"));
        }
        let end = self.consumed + self.buf.len() as u64;
        if examined > end {
            return Err(CursorError::InvalidAdvance("examined watermark past buffered data"));
        }

        self.buf.advance((consumed - self.consumed) as usize);
        self.consumed = consumed;
        self.examined = examined;
        Ok(())
    }

    /// Tear down the cursor, returning the inner stream and the unconsumed
    /// leftover bytes.
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.stream, self.buf)
    }
}

impl<S: AsyncRead + Unpin> ChunkReader<S> {
    /// Wait until there is unexamined data, the stream completes, the
    /// deadline elapses, or the shutdown signal fires — whichever comes
    /// first — then return every unconsumed byte.
    pub async fn read_chunk(
        &mut self,
        deadline: Option<Instant>,
        closed: &CancellationToken,
    ) -> Result<Chunk<'_>, CursorError> {
        while !self.completed && !self.cancelled && self.unexamined() == 0 {
            self.fill(deadline, closed).await?;
        }

        Ok(Chunk {
            bytes: &self.buf[..],
            is_completed: self.completed,
            is_cancelled: self.cancelled,
        })
    }

    async fn fill(
        &mut self,
        deadline: Option<Instant>,
        closed: &CancellationToken,
    ) -> Result<(), CursorError> {
        let stream = &mut self.stream;
        let buf = &mut self.buf;
        let read = async {
            match deadline {
                Some(at) => match tokio::time::timeout_at(at, stream.read_buf(buf)).await {
                    Ok(result) => result.map_err(CursorError::Io),
                    Err(_) => Err(CursorError::DeadlineExceeded),
                },
                None => stream.read_buf(buf).await.map_err(CursorError::Io),
            }
        };

        tokio::select! {
            biased;
            _ = closed.cancelled() => {
                self.cancelled = true;
                Ok(())
            }
            result = read => {
                if result? == 0 {
                    self.completed = true;
                }
                Ok(())
            }
        }
    }
}

/// Stream that replays leftover preamble bytes ahead of the inner stream.
///
/// Handed to the downstream stage so it observes the connection exactly as
/// if the PROXY header had never been on the wire.
#[derive(Debug)]
pub struct RewoundStream<S> {
    head: BytesMut,
    inner: S,
}

impl<S> RewoundStream<S> {
    pub fn new(head: BytesMut, inner: S) -> Self {
        Self { head, inner }
    }

    /// Bytes that will be served before the inner stream is read again.
    pub fn leftover(&self) -> &[u8] {
        &self.head
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewoundStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.head.is_empty() {
            let len = this.head.len().min(buf.remaining());
            buf.put_slice(&this.head[..len]);
            this.head.advance(len);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewoundStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
