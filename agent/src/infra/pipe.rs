//! Byte pipes bridging connection tasks and `AsyncRead`/`AsyncWrite` consumers

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Chunks buffered between a demultiplexer and the reader of one logical stream
pub const PIPE_CAPACITY: usize = 32;

/// Create a pipe whose read side is an `AsyncRead`
pub fn pipe() -> (mpsc::Sender<Bytes>, PipeReader) {
    let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
    (tx, PipeReader::new(rx))
}

/// Reads chunks pushed by a connection task; EOF once every sender is dropped
pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl PipeReader {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.pending.is_empty() {
            match ready!(self.rx.poll_recv(cx)) {
                Some(chunk) => self.pending = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending[..n]);
        self.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

/// Turns every write into one item for a connection's writer task
pub struct FrameWriter<T: Send + 'static> {
    tx: PollSender<T>,
    frame: Box<dyn Fn(Bytes) -> T + Send + Sync>,
    on_close: Option<T>,
}

impl<T: Send + 'static> FrameWriter<T> {
    pub fn new(tx: mpsc::Sender<T>, frame: impl Fn(Bytes) -> T + Send + Sync + 'static) -> Self {
        Self {
            tx: PollSender::new(tx),
            frame: Box::new(frame),
            on_close: None,
        }
    }

    /// Item sent once when the writer is shut down
    pub fn with_close(mut self, item: T) -> Self {
        self.on_close = Some(item);
        self
    }
}

impl<T: Send + 'static> Unpin for FrameWriter<T> {}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}

impl<T: Send + 'static> AsyncWrite for FrameWriter<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.tx.poll_reserve(cx)).map_err(|_| closed())?;
        let item = (self.frame)(Bytes::copy_from_slice(buf));
        self.tx.send_item(item).map_err(|_| closed())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.on_close.is_some() {
            if ready!(self.tx.poll_reserve(cx)).is_ok() {
                if let Some(item) = self.on_close.take() {
                    let _ = self.tx.send_item(item);
                }
            } else {
                self.on_close = None;
            }
        }
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}
