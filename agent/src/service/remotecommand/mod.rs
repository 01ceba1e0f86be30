//! Remote-command streaming: transport negotiation, protocol versions and
//! the per-request bundle of logical streams handed to the runtime adapter

pub mod exec;
pub mod httpstream;
pub mod protocol;
pub mod resize;
pub mod websocket;

use std::future::Future;
use std::time::Duration;

use axum::{extract::Request, response::Response};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use self::httpstream::{is_spdy_upgrade, is_websocket_request, plain_error};
use self::protocol::{ProtocolVersion, SpdyStreams};
use crate::config::Config;
use crate::domain::{Status, StreamOptions, TerminalSize};
use crate::error::{Error, Result};
use crate::infra::idle::IdleTimer;
use crate::infra::spdy::Connection;
use crate::infra::wsstream::Conn;
use crate::service::exec::{BoxReader, BoxWriter};

pub use self::exec::{serve_attach, serve_exec};
pub use self::protocol::SUPPORTED_STREAMING_PROTOCOLS;

/// Resize events are handed over one at a time so a slow runtime holds the client back
const RESIZE_CHANNEL_CAPACITY: usize = 1;

/// Negotiation parameters shared by every streaming request
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub supported_protocols: Vec<String>,
    pub idle_timeout: Option<Duration>,
    pub creation_timeout: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            supported_protocols: config.supported_protocols.clone(),
            idle_timeout: config.idle_timeout(),
            creation_timeout: config.creation_timeout(),
        }
    }
}

/// How the final status is written on the error stream
pub enum StatusWriter {
    /// Failure message as plain text; success writes nothing
    Raw(BoxWriter),
    /// The whole status serialized as JSON
    Json(BoxWriter),
    /// The error stream is unusable
    Closed,
}

impl StatusWriter {
    pub async fn write(&mut self, status: &Status) -> Result<()> {
        match self {
            StatusWriter::Raw(w) => {
                if status.is_success() {
                    return Ok(());
                }
                w.write_all(status.message.as_bytes()).await?;
                w.flush().await?;
            }
            StatusWriter::Json(w) => {
                let body = serde_json::to_vec(status).map_err(|e| Error::Internal(e.to_string()))?;
                w.write_all(&body).await?;
                w.flush().await?;
            }
            StatusWriter::Closed => {
                debug!("error stream closed, dropping status {}", status.status);
            }
        }
        Ok(())
    }
}

/// The transport carrying a bundle's streams
pub enum StreamConnection {
    Spdy(Connection),
    WebSocket(Conn),
}

impl StreamConnection {
    /// Resolves once the client is gone or the idle timeout fired
    pub async fn closed(&self) {
        match self {
            StreamConnection::Spdy(c) => c.closed().await,
            StreamConnection::WebSocket(c) => c.closed().await,
        }
    }

    /// Flush pending frames and close the transport
    pub async fn close(&self) {
        match self {
            StreamConnection::Spdy(c) => c.close().await,
            StreamConnection::WebSocket(c) => c.close().await,
        }
    }
}

/// Negotiated logical streams of one exec or attach request
pub struct StreamBundle {
    pub stdin: Option<BoxReader>,
    pub stdout: Option<BoxWriter>,
    pub stderr: Option<BoxWriter>,
    pub resize: Option<mpsc::Receiver<TerminalSize>>,
    pub tty: bool,
    pub status: StatusWriter,
    pub conn: StreamConnection,
}

impl StreamBundle {
    fn from_spdy(streams: SpdyStreams, version: ProtocolVersion, tty: bool, conn: Connection) -> Self {
        let SpdyStreams {
            stdin,
            stdout,
            stderr,
            error,
            resize,
        } = streams;

        let status = match error {
            // v1 resets the error stream once streams are set up
            Some(_) if version == ProtocolVersion::V1 => StatusWriter::Closed,
            Some(s) if version.writes_json_status() => StatusWriter::Json(Box::pin(s.writer())),
            Some(s) => StatusWriter::Raw(Box::pin(s.writer())),
            None => StatusWriter::Closed,
        };

        Self {
            stdin: stdin
                .and_then(|mut s| s.take_reader())
                .map(|r| Box::pin(r) as BoxReader),
            stdout: stdout.map(|s| Box::pin(s.writer()) as BoxWriter),
            stderr: stderr.map(|s| Box::pin(s.writer()) as BoxWriter),
            resize: resize
                .and_then(|mut s| s.take_reader())
                .map(|r| spawn_resize_pump(Box::pin(r))),
            tty,
            status,
            conn: StreamConnection::Spdy(conn),
        }
    }
}

/// Decode the resize stream on its own task
fn spawn_resize_pump(reader: BoxReader) -> mpsc::Receiver<TerminalSize> {
    let (tx, rx) = mpsc::channel(RESIZE_CHANNEL_CAPACITY);
    tokio::spawn(resize::handle_resize_events(reader, tx));
    rx
}

/// Upgrade `req` to WebSocket or SPDY and run `session` with the negotiated
/// streams. The returned response is either the upgrade response or the
/// error the client sees when negotiation fails.
pub async fn create_streams<F, Fut>(
    req: Request,
    opts: StreamOptions,
    settings: &StreamSettings,
    uid: String,
    session: F,
) -> Response
where
    F: FnOnce(StreamBundle) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if is_websocket_request(req.headers()) {
        info!("start createWebSocketStreams, uid={}", uid);
        websocket::create_websocket_streams(req, opts, settings, session).await
    } else {
        info!("start createHttpStreamStreams, uid={}", uid);
        create_spdy_streams(req, opts, settings, uid, session)
    }
}

fn create_spdy_streams<F, Fut>(
    mut req: Request,
    opts: StreamOptions,
    settings: &StreamSettings,
    uid: String,
    session: F,
) -> Response
where
    F: FnOnce(StreamBundle) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let protocol = match httpstream::handshake(req.headers(), &settings.supported_protocols) {
        Ok(protocol) => protocol,
        Err(response) => {
            warn!("stream protocol negotiation failed, uid={}", uid);
            return response;
        }
    };
    if !is_spdy_upgrade(req.headers()) {
        return plain_error(&Error::MissingUpgradeHeaders);
    }

    let version = ProtocolVersion::from_negotiated(&protocol);
    let on_upgrade = hyper::upgrade::on(&mut req);
    let settings = settings.clone();

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("spdy upgrade failed, err={}, uid={}", e, uid);
                return;
            }
        };
        let mut conn = match Connection::new(
            TokioIo::new(upgraded),
            IdleTimer::new(settings.idle_timeout),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("create spdy connection failed, err={}, uid={}", e, uid);
                return;
            }
        };
        let Some(mut incoming) = conn.incoming() else {
            return;
        };

        let expected = version.expected_streams(&opts);
        let streams = version
            .wait_for_streams(&mut incoming, expected, settings.creation_timeout)
            .await;
        // Streams opened from here on are refused
        drop(incoming);

        match streams {
            Ok(streams) => {
                debug!(
                    "received {} streams over {}, uid={}",
                    expected,
                    version.name(),
                    uid
                );
                session(StreamBundle::from_spdy(streams, version, opts.tty, conn)).await;
            }
            Err(e) => {
                warn!("createStreams failed, err={}, uid={}", e, uid);
                conn.close().await;
            }
        }
    });

    httpstream::spdy_switching_protocols(&protocol)
}
