//! Channel multiplexing over a single WebSocket
//!
//! Every message carries one channel's data prefixed by the channel index,
//! either as a raw byte (binary codec) or as the ASCII digit `'0' + index`
//! followed by base64 text (base64 codec).

use axum::extract::ws::Message;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::infra::idle::IdleTimer;
use crate::infra::pipe::{pipe, FrameWriter, PipeReader};

const OUTGOING_CAPACITY: usize = 64;

/// Direction(s) a channel carries data in, from the server's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Ignore,
    Read,
    Write,
    ReadWrite,
}

impl ChannelType {
    fn readable(self) -> bool {
        matches!(self, ChannelType::Read | ChannelType::ReadWrite)
    }

    fn writable(self) -> bool {
        matches!(self, ChannelType::Write | ChannelType::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Binary,
    Base64,
}

/// Tag `data` with its channel index
pub fn encode_frame(codec: Codec, channel: u8, data: &[u8]) -> Message {
    match codec {
        Codec::Binary => {
            let mut frame = Vec::with_capacity(data.len() + 1);
            frame.push(channel);
            frame.extend_from_slice(data);
            Message::Binary(frame.into())
        }
        Codec::Base64 => {
            let mut frame = String::with_capacity(data.len() * 4 / 3 + 5);
            frame.push(char::from(b'0' + channel));
            STANDARD.encode_string(data, &mut frame);
            Message::Text(frame.into())
        }
    }
}

/// Split an inbound message into channel index and payload
pub fn decode_frame(codec: Codec, frame: &[u8]) -> Result<(usize, Bytes), String> {
    let Some((&first, payload)) = frame.split_first() else {
        return Err("empty frame".to_string());
    };
    match codec {
        Codec::Binary => Ok((first as usize, Bytes::copy_from_slice(payload))),
        Codec::Base64 => {
            let channel = first
                .checked_sub(b'0')
                .ok_or_else(|| format!("invalid channel prefix {}", first))?;
            let data = STANDARD
                .decode(payload)
                .map_err(|e| format!("base64 decode failed: {}", e))?;
            Ok((channel as usize, Bytes::from(data)))
        }
    }
}

/// The endpoints of one channel; absent halves are not carried by the channel type
pub struct Channel {
    pub reader: Option<PipeReader>,
    pub writer: Option<FrameWriter<Message>>,
}

/// A multiplexed WebSocket connection
pub struct Conn {
    codec: Codec,
    out: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    done: CancellationToken,
}

impl Conn {
    /// Start the read and write pumps over the two halves of a socket
    pub fn open<Tx, Rx, E>(
        sink: Tx,
        stream: Rx,
        codec: Codec,
        channels: &[ChannelType],
        idle: IdleTimer,
    ) -> (Conn, Vec<Channel>)
    where
        Tx: Sink<Message> + Send + Unpin + 'static,
        Tx::Error: std::fmt::Display,
        Rx: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let shutdown = CancellationToken::new();
        let done = CancellationToken::new();

        let mut routes = Vec::with_capacity(channels.len());
        let mut endpoints = Vec::with_capacity(channels.len());
        for (idx, kind) in channels.iter().enumerate() {
            let reader = if kind.readable() {
                let (tx, reader) = pipe();
                routes.push(Some(tx));
                Some(reader)
            } else {
                routes.push(None);
                None
            };
            let writer = kind.writable().then(|| {
                let channel = idx as u8;
                FrameWriter::new(out_tx.clone(), move |data: Bytes| {
                    encode_frame(codec, channel, &data)
                })
            });
            endpoints.push(Channel { reader, writer });
        }

        tokio::spawn(read_loop(stream, codec, routes, idle.clone(), shutdown.clone()));
        tokio::spawn(write_loop(sink, out_rx, idle.clone(), shutdown.clone(), done.clone()));
        tokio::spawn(idle.watch(shutdown.clone(), "websocket connection"));

        (
            Conn {
                codec,
                out: out_tx,
                shutdown,
                done,
            },
            endpoints,
        )
    }

    /// Send a frame with no payload on `channel`
    pub async fn write_empty(&self, channel: u8) {
        let _ = self.out.send(encode_frame(self.codec, channel, &[])).await;
    }

    /// Resolves when the peer went away, the idle timeout fired or `close` was called
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Flush queued frames, send a close frame and wait for the writer to finish
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.done.cancelled().await;
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_loop<Rx, E>(
    mut stream: Rx,
    codec: Codec,
    mut routes: Vec<Option<mpsc::Sender<Bytes>>>,
    idle: IdleTimer,
    shutdown: CancellationToken,
) where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display + Send + 'static,
{
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = stream.next() => msg,
        };
        let data = match msg {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Some(Ok(Message::Close(_))) | None => {
                debug!("websocket peer closed the connection");
                break;
            }
            Some(Ok(_)) => {
                idle.touch();
                continue;
            }
            Some(Err(e)) => {
                debug!("websocket read failed, err={}", e);
                break;
            }
        };
        idle.touch();

        let (channel, payload) = match decode_frame(codec, &data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping websocket frame, err={}", e);
                continue;
            }
        };
        if channel >= routes.len() {
            warn!(
                "frame is targeted for a reader {} that is not valid, possible protocol error",
                channel
            );
            continue;
        }
        let Some(tx) = &routes[channel] else {
            continue;
        };
        if !payload.is_empty() && tx.send(payload).await.is_err() {
            routes[channel] = None;
        }
    }

    // Dropping the routes delivers EOF to every channel reader
    routes.clear();
    shutdown.cancel();
}

async fn write_loop<Tx>(
    mut sink: Tx,
    mut queue: mpsc::Receiver<Message>,
    idle: IdleTimer,
    shutdown: CancellationToken,
    done: CancellationToken,
) where
    Tx: Sink<Message> + Unpin,
    Tx::Error: std::fmt::Display,
{
    let mut healthy = true;
    loop {
        let msg = tokio::select! {
            biased;
            msg = queue.recv() => msg,
            _ = shutdown.cancelled() => None,
        };
        let Some(msg) = msg else { break };
        if let Err(e) = sink.send(msg).await {
            debug!("websocket write failed, err={}", e);
            healthy = false;
            break;
        }
        idle.touch();
    }

    if healthy {
        while let Ok(msg) = queue.try_recv() {
            if sink.send(msg).await.is_err() {
                healthy = false;
                break;
            }
        }
    }
    if healthy {
        let _ = sink.send(Message::Close(None)).await;
    }
    let _ = sink.close().await;

    shutdown.cancel();
    done.cancel();
}
