//! Server side of a SPDY/3.1 session over an upgraded HTTP connection
//!
//! A session runs three tasks: a reader that demultiplexes frames into
//! per-stream pipes, a writer that serializes every outgoing frame, and a
//! watchdog enforcing the idle timeout. They share one cancellation token;
//! whichever task ends first tears the others down.

use std::collections::HashMap;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::{SpdyDecoder, SpdyEncoder};
use super::frame::*;
use crate::error::Result;
use crate::infra::idle::IdleTimer;
use crate::infra::pipe::{pipe, FrameWriter, PipeReader};

const OUTGOING_CAPACITY: usize = 64;
const INCOMING_CAPACITY: usize = 16;

/// A frame queued for the writer, optionally acknowledged once written
pub struct Outgoing {
    frame: Frame,
    sent: Option<oneshot::Sender<()>>,
}

impl From<Frame> for Outgoing {
    fn from(frame: Frame) -> Self {
        Self { frame, sent: None }
    }
}

/// A stream opened by the client, paired with its SYN_REPLY acknowledgment
pub struct IncomingStream {
    pub stream: SpdyStream,
    pub reply_sent: oneshot::Receiver<()>,
}

pub struct Connection {
    incoming: Option<mpsc::Receiver<IncomingStream>>,
    shutdown: CancellationToken,
    done: CancellationToken,
}

impl Connection {
    /// Start serving a session on `io`
    pub fn new<T>(io: T, idle: IdleTimer) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let frames_in = FramedRead::new(read_half, SpdyDecoder::new());
        let frames_out = FramedWrite::new(write_half, SpdyEncoder::new()?);

        let (out_tx, out_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        let shutdown = CancellationToken::new();
        let done = CancellationToken::new();

        tokio::spawn(read_loop(
            frames_in,
            out_tx,
            incoming_tx,
            idle.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(write_loop(
            frames_out,
            out_rx,
            idle.clone(),
            shutdown.clone(),
            done.clone(),
        ));
        tokio::spawn(idle.watch(shutdown.clone(), "spdy session"));

        Ok(Self {
            incoming: Some(incoming_rx),
            shutdown,
            done,
        })
    }

    /// Streams opened by the client; can be taken once. Dropping the receiver
    /// makes the session refuse any further stream.
    pub fn incoming(&mut self) -> Option<mpsc::Receiver<IncomingStream>> {
        self.incoming.take()
    }

    /// Resolves when the peer went away, the idle timeout fired or `close` was called
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Flush queued frames, send GOAWAY and shut the socket down
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.done.cancelled().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_loop<R>(
    mut frames: FramedRead<R, SpdyDecoder>,
    out: mpsc::Sender<Outgoing>,
    incoming: mpsc::Sender<IncomingStream>,
    idle: IdleTimer,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut streams: HashMap<u32, mpsc::Sender<Bytes>> = HashMap::new();

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("spdy session read failed, err={}", e);
                let _ = out
                    .send(
                        Frame::GoAway {
                            last_good_stream_id: 0,
                            status: GOAWAY_PROTOCOL_ERROR,
                        }
                        .into(),
                    )
                    .await;
                break;
            }
            None => {
                debug!("spdy peer closed the connection");
                break;
            }
        };
        idle.touch();

        match frame {
            Frame::SynStream {
                stream_id,
                flags,
                headers,
                ..
            } => {
                if streams.contains_key(&stream_id) {
                    warn!("spdy stream {} opened twice", stream_id);
                    let _ = out.send(Frame::reset(stream_id, RST_STREAM_IN_USE).into()).await;
                    continue;
                }

                let (data_tx, reader) = pipe();
                let (sent_tx, sent_rx) = oneshot::channel();
                let stream = SpdyStream {
                    id: stream_id,
                    headers,
                    reader: Some(reader),
                    out: out.clone(),
                };
                if incoming
                    .try_send(IncomingStream {
                        stream,
                        reply_sent: sent_rx,
                    })
                    .is_err()
                {
                    debug!("refusing spdy stream {}", stream_id);
                    let _ = out.send(Frame::reset(stream_id, RST_REFUSED_STREAM).into()).await;
                    continue;
                }
                if flags & FLAG_FIN == 0 {
                    streams.insert(stream_id, data_tx);
                }

                let reply = Outgoing {
                    frame: Frame::SynReply {
                        stream_id,
                        flags: 0,
                        headers: HeaderBlock::new(),
                    },
                    sent: Some(sent_tx),
                };
                if out.send(reply).await.is_err() {
                    break;
                }
            }
            Frame::Data {
                stream_id,
                flags,
                data,
            } => {
                let Some(tx) = streams.get(&stream_id) else {
                    debug!("data for unknown spdy stream {}", stream_id);
                    continue;
                };
                if !data.is_empty() && tx.send(data).await.is_err() {
                    // Local reader is gone; later data for this stream is discarded
                    streams.remove(&stream_id);
                    continue;
                }
                if flags & FLAG_FIN != 0 {
                    streams.remove(&stream_id);
                }
            }
            Frame::RstStream { stream_id, status } => {
                debug!("spdy stream {} reset by peer, status={}", stream_id, status);
                streams.remove(&stream_id);
            }
            Frame::Ping { id } => {
                let _ = out.send(Frame::Ping { id }.into()).await;
            }
            Frame::GoAway { status, .. } => {
                debug!("spdy peer sent GOAWAY, status={}", status);
                break;
            }
            other => {
                debug!("ignoring spdy {} frame", other.name());
            }
        }
    }

    // Dropping the stream senders delivers EOF to every local reader
    streams.clear();
    shutdown.cancel();
}

async fn write_loop<W>(
    mut frames: FramedWrite<W, SpdyEncoder>,
    mut queue: mpsc::Receiver<Outgoing>,
    idle: IdleTimer,
    shutdown: CancellationToken,
    done: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut healthy = true;
    loop {
        let item = tokio::select! {
            biased;
            item = queue.recv() => item,
            _ = shutdown.cancelled() => None,
        };
        let Some(item) = item else { break };
        if !write_one(&mut frames, item, &idle).await {
            healthy = false;
            break;
        }
    }

    if healthy {
        while let Ok(item) = queue.try_recv() {
            if !write_one(&mut frames, item, &idle).await {
                healthy = false;
                break;
            }
        }
    }
    if healthy {
        let _ = frames
            .send(Frame::GoAway {
                last_good_stream_id: 0,
                status: GOAWAY_OK,
            })
            .await;
    }
    let _ = frames.close().await;

    shutdown.cancel();
    done.cancel();
}

async fn write_one<W>(frames: &mut FramedWrite<W, SpdyEncoder>, item: Outgoing, idle: &IdleTimer) -> bool
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = frames.send(item.frame).await {
        debug!("spdy session write failed, err={}", e);
        return false;
    }
    idle.touch();
    if let Some(sent) = item.sent {
        let _ = sent.send(());
    }
    true
}

/// One logical stream of a session
pub struct SpdyStream {
    id: u32,
    headers: HeaderBlock,
    reader: Option<PipeReader>,
    out: mpsc::Sender<Outgoing>,
}

impl SpdyStream {
    /// Value of the `streamType` header
    pub fn stream_type(&self) -> Option<&str> {
        self.headers.get("streamtype")
    }

    /// Data sent by the client on this stream; can be taken once
    pub fn take_reader(&mut self) -> Option<PipeReader> {
        self.reader.take()
    }

    /// Writer sending one data frame per write; shutdown half-closes the stream
    pub fn writer(&self) -> FrameWriter<Outgoing> {
        let id = self.id;
        FrameWriter::new(self.out.clone(), move |data| Frame::data(id, data).into())
            .with_close(Frame::fin(id).into())
    }

    /// Half-close the server side
    pub async fn close(&self) {
        let _ = self.out.send(Frame::fin(self.id).into()).await;
    }

    /// Abort the stream in both directions
    pub async fn reset(&self) {
        let _ = self.out.send(Frame::reset(self.id, RST_CANCEL).into()).await;
    }
}

impl std::fmt::Debug for SpdyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpdyStream")
            .field("id", &self.id)
            .field("headers", &self.headers)
            .finish()
    }
}
