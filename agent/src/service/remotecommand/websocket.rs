//! WebSocket transport for remote commands
//!
//! Channels are fixed by position: stdin, stdout, stderr, error, resize.

use std::future::Future;

use axum::{
    extract::{ws::WebSocketUpgrade, FromRequestParts, Request},
    http::header,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tracing::{debug, warn};

use super::httpstream::{bracketed, header_values, plain_error};
use super::{spawn_resize_pump, StatusWriter, StreamBundle, StreamConnection, StreamSettings};
use crate::domain::StreamOptions;
use crate::error::Error;
use crate::infra::idle::IdleTimer;
use crate::infra::wsstream::{Channel, ChannelType, Codec, Conn};
use crate::service::exec::{BoxReader, BoxWriter};

pub const CHANNEL_WEBSOCKET_PROTOCOL: &str = "channel.k8s.io";
pub const BASE64_CHANNEL_WEBSOCKET_PROTOCOL: &str = "base64.channel.k8s.io";
pub const V4_BINARY_WEBSOCKET_PROTOCOL: &str = "v4.channel.k8s.io";
pub const V4_BASE64_WEBSOCKET_PROTOCOL: &str = "v4.base64.channel.k8s.io";

const STDIN_CHANNEL: usize = 0;
const STDOUT_CHANNEL: usize = 1;
const STDERR_CHANNEL: usize = 2;
const ERROR_CHANNEL: usize = 3;
const RESIZE_CHANNEL: usize = 4;

/// Sub-protocol settled on for a WebSocket session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketProtocol {
    /// Echoed back to the client; empty when the client offered none
    pub name: String,
    pub codec: Codec,
    pub json_status: bool,
}

impl WebSocketProtocol {
    fn lookup(name: &str) -> Option<Self> {
        let (codec, json_status) = match name {
            "" | CHANNEL_WEBSOCKET_PROTOCOL => (Codec::Binary, false),
            BASE64_CHANNEL_WEBSOCKET_PROTOCOL => (Codec::Base64, false),
            V4_BINARY_WEBSOCKET_PROTOCOL => (Codec::Binary, true),
            V4_BASE64_WEBSOCKET_PROTOCOL => (Codec::Base64, true),
            _ => return None,
        };
        Some(Self {
            name: name.to_string(),
            codec,
            json_status,
        })
    }
}

/// First offered protocol the agent understands; no offer means binary framing
pub fn select_protocol(offered: &[String]) -> Result<WebSocketProtocol, Error> {
    if offered.is_empty() {
        return WebSocketProtocol::lookup("")
            .ok_or_else(|| Error::Internal("missing default protocol".to_string()));
    }
    offered
        .iter()
        .find_map(|p| WebSocketProtocol::lookup(p))
        .ok_or_else(|| Error::UnsupportedProtocol(bracketed(offered)))
}

/// Channel layout for the requested streams
pub fn channel_layout(opts: &StreamOptions) -> [ChannelType; 5] {
    let pick = |wanted: bool, kind: ChannelType| if wanted { kind } else { ChannelType::Ignore };
    [
        pick(opts.stdin, ChannelType::Read),
        pick(opts.stdout, ChannelType::Write),
        pick(opts.stderr, ChannelType::Write),
        ChannelType::Write,
        pick(opts.tty, ChannelType::Read),
    ]
}

/// Lowest writable channel; an empty frame on it tells the client streams are ready
fn ready_channel(opts: &StreamOptions) -> u8 {
    if opts.stdout {
        STDOUT_CHANNEL as u8
    } else if opts.stderr {
        STDERR_CHANNEL as u8
    } else {
        ERROR_CHANNEL as u8
    }
}

pub(super) async fn create_websocket_streams<F, Fut>(
    req: Request,
    opts: StreamOptions,
    settings: &StreamSettings,
    session: F,
) -> Response
where
    F: FnOnce(StreamBundle) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let offered = header_values(req.headers(), header::SEC_WEBSOCKET_PROTOCOL.as_str());
    let protocol = match select_protocol(&offered) {
        Ok(protocol) => protocol,
        Err(e) => {
            warn!("websocket protocol negotiation failed, err={}", e);
            return plain_error(&e);
        }
    };

    let (mut parts, _body) = req.into_parts();
    let upgrade = match <WebSocketUpgrade as FromRequestParts<()>>::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    let upgrade = if protocol.name.is_empty() {
        upgrade
    } else {
        upgrade.protocols([protocol.name.clone()])
    };

    let idle = IdleTimer::new(settings.idle_timeout);
    upgrade
        .on_failed_upgrade(|e| warn!("websocket upgrade failed, err={}", e))
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            let layout = channel_layout(&opts);
            let (conn, channels) = Conn::open(sink, stream, protocol.codec, &layout, idle);
            conn.write_empty(ready_channel(&opts)).await;
            debug!("websocket streams ready, protocol={:?}", protocol.name);

            let bundle = bundle_from_channels(channels, &protocol, opts.tty, conn);
            session(bundle).await;
        })
}

fn bundle_from_channels(
    channels: Vec<Channel>,
    protocol: &WebSocketProtocol,
    tty: bool,
    conn: Conn,
) -> StreamBundle {
    let mut channels: Vec<Option<Channel>> = channels.into_iter().map(Some).collect();
    let mut take = |idx: usize| channels.get_mut(idx).and_then(Option::take);

    let reader = |c: Option<Channel>| c.and_then(|c| c.reader).map(|r| Box::pin(r) as BoxReader);
    let writer = |c: Option<Channel>| c.and_then(|c| c.writer).map(|w| Box::pin(w) as BoxWriter);

    let stdin = reader(take(STDIN_CHANNEL));
    let stdout = writer(take(STDOUT_CHANNEL));
    let stderr = writer(take(STDERR_CHANNEL));
    let status = match writer(take(ERROR_CHANNEL)) {
        Some(w) if protocol.json_status => StatusWriter::Json(w),
        Some(w) => StatusWriter::Raw(w),
        None => StatusWriter::Closed,
    };
    let resize = reader(take(RESIZE_CHANNEL)).map(spawn_resize_pump);

    StreamBundle {
        stdin,
        stdout,
        stderr,
        resize,
        tty,
        status,
        conn: StreamConnection::WebSocket(conn),
    }
}
