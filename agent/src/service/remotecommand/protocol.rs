//! Remote-command protocol versions spoken over SPDY

use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::domain::StreamOptions;
use crate::error::{Error, Result};
use crate::infra::spdy::{IncomingStream, SpdyStream};

pub const STREAM_PROTOCOL_V1_NAME: &str = "channel.k8s.io";
pub const STREAM_PROTOCOL_V2_NAME: &str = "v2.channel.k8s.io";
pub const STREAM_PROTOCOL_V3_NAME: &str = "v3.channel.k8s.io";
pub const STREAM_PROTOCOL_V4_NAME: &str = "v4.channel.k8s.io";

/// Protocols accepted on the SPDY path, most preferred first
pub const SUPPORTED_STREAMING_PROTOCOLS: [&str; 4] = [
    STREAM_PROTOCOL_V4_NAME,
    STREAM_PROTOCOL_V3_NAME,
    STREAM_PROTOCOL_V2_NAME,
    STREAM_PROTOCOL_V1_NAME,
];

pub const STREAM_TYPE_STDIN: &str = "stdin";
pub const STREAM_TYPE_STDOUT: &str = "stdout";
pub const STREAM_TYPE_STDERR: &str = "stderr";
pub const STREAM_TYPE_ERROR: &str = "error";
pub const STREAM_TYPE_RESIZE: &str = "resize";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
    V3,
    V4,
}

/// Streams opened by the client, keyed by their `streamType`
#[derive(Debug, Default)]
pub struct SpdyStreams {
    pub stdin: Option<SpdyStream>,
    pub stdout: Option<SpdyStream>,
    pub stderr: Option<SpdyStream>,
    pub error: Option<SpdyStream>,
    pub resize: Option<SpdyStream>,
}

impl ProtocolVersion {
    /// Map a negotiated protocol name; an empty negotiation means v1
    pub fn from_negotiated(protocol: &str) -> Self {
        match protocol {
            STREAM_PROTOCOL_V4_NAME => ProtocolVersion::V4,
            STREAM_PROTOCOL_V3_NAME => ProtocolVersion::V3,
            STREAM_PROTOCOL_V2_NAME => ProtocolVersion::V2,
            "" => {
                debug!(
                    "Client did not request protocol negotiation. Falling back to {}",
                    STREAM_PROTOCOL_V1_NAME
                );
                ProtocolVersion::V1
            }
            _ => ProtocolVersion::V1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolVersion::V1 => STREAM_PROTOCOL_V1_NAME,
            ProtocolVersion::V2 => STREAM_PROTOCOL_V2_NAME,
            ProtocolVersion::V3 => STREAM_PROTOCOL_V3_NAME,
            ProtocolVersion::V4 => STREAM_PROTOCOL_V4_NAME,
        }
    }

    pub fn supports_terminal_resizing(&self) -> bool {
        matches!(self, ProtocolVersion::V3 | ProtocolVersion::V4)
    }

    /// v4 reports the final status as JSON, older versions as plain text
    pub fn writes_json_status(&self) -> bool {
        matches!(self, ProtocolVersion::V4)
    }

    /// The error stream plus one per requested stream, plus resize for a TTY
    pub fn expected_streams(&self, opts: &StreamOptions) -> usize {
        let mut expected = 1;
        for wanted in [opts.stdin, opts.stdout, opts.stderr] {
            if wanted {
                expected += 1;
            }
        }
        if opts.tty && self.supports_terminal_resizing() {
            expected += 1;
        }
        expected
    }

    /// Collect client streams until `expected` of them have been acknowledged
    /// or `timeout` elapses. Streams of unknown type are not counted.
    pub async fn wait_for_streams(
        &self,
        incoming: &mut mpsc::Receiver<IncomingStream>,
        expected: usize,
        timeout: Duration,
    ) -> Result<SpdyStreams> {
        let mut streams = SpdyStreams::default();
        let mut replies: FuturesUnordered<oneshot::Receiver<()>> = FuturesUnordered::new();
        let mut received = 0;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        while received < expected {
            tokio::select! {
                next = incoming.recv() => {
                    let Some(IncomingStream { stream, reply_sent }) = next else {
                        return Err(Error::Stream(
                            "connection closed before all streams were created".to_string(),
                        ));
                    };
                    let stream_type = stream.stream_type().unwrap_or_default().to_string();
                    let slot = match stream_type.as_str() {
                        STREAM_TYPE_ERROR => &mut streams.error,
                        STREAM_TYPE_STDIN => &mut streams.stdin,
                        STREAM_TYPE_STDOUT => &mut streams.stdout,
                        STREAM_TYPE_STDERR => &mut streams.stderr,
                        STREAM_TYPE_RESIZE if self.supports_terminal_resizing() => {
                            &mut streams.resize
                        }
                        other => {
                            warn!("Unexpected stream type: {:?}", other);
                            continue;
                        }
                    };
                    *slot = Some(stream);
                    replies.push(reply_sent);
                }
                Some(sent) = replies.next(), if !replies.is_empty() => {
                    if sent.is_err() {
                        return Err(Error::Stream(
                            "connection closed before stream replies were sent".to_string(),
                        ));
                    }
                    received += 1;
                }
                _ = &mut deadline => return Err(Error::StreamCreationTimeout),
            }
        }

        if *self == ProtocolVersion::V1 {
            // v1 clients expect stdin to be half-closed by the server right away
            if let Some(stdin) = &streams.stdin {
                stdin.close().await;
            }
            // and never receive anything on the error stream
            if let Some(error) = &streams.error {
                error.reset().await;
            }
        }

        Ok(streams)
    }
}
